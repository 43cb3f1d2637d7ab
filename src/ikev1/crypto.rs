use std::{error, fmt};

use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use crypto_bigint::{
    const_residue, impl_modulus,
    modular::constant_mod::ResidueParams,
    rand_core::OsRng,
    Encoding, Random, U1024, U2048,
};
use hmac::{Hmac, Mac};
use log::debug;
use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const MAX_DH_KEY_LENGTH: usize = 2048 / 8;
pub const MAX_PRF_OUTPUT_LENGTH: usize = 256 / 8;
pub const MAX_HASH_OUTPUT_LENGTH: usize = 256 / 8;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

type HmacMd5 = Hmac<Md5>;
type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub struct Array<const M: usize> {
    data: [u8; M],
    len: usize,
}

impl<const M: usize> Array<M> {
    pub fn new(len: usize) -> Array<M> {
        Array { data: [0u8; M], len }
    }

    pub fn from_slice(src: &[u8]) -> Array<M> {
        let mut result = Array::new(src.len());
        result.as_mut_slice().copy_from_slice(src);
        result
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const M: usize> Drop for Array<M> {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct HashAlgorithm(u16);

// Oakley hash algorithm identifiers from RFC 2409 Appendix A.
impl HashAlgorithm {
    pub const MD5: HashAlgorithm = HashAlgorithm(1);
    pub const SHA1: HashAlgorithm = HashAlgorithm(2);
    pub const SHA2_256: HashAlgorithm = HashAlgorithm(4);

    pub fn from_u16(value: u16) -> HashAlgorithm {
        HashAlgorithm(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        matches!(*self, Self::MD5 | Self::SHA1 | Self::SHA2_256)
    }

    pub fn output_length(&self) -> usize {
        match *self {
            Self::MD5 => 128 / 8,
            Self::SHA1 => 160 / 8,
            Self::SHA2_256 => 256 / 8,
            _ => 0,
        }
    }

    pub fn hash(&self, data: &[&[u8]]) -> Result<Array<MAX_HASH_OUTPUT_LENGTH>, CryptoError> {
        match *self {
            Self::MD5 => {
                let mut digest = Md5::new();
                data.iter().for_each(|chunk| digest.update(chunk));
                Ok(Array::from_slice(&digest.finalize()))
            }
            Self::SHA1 => {
                let mut digest = Sha1::new();
                data.iter().for_each(|chunk| digest.update(chunk));
                Ok(Array::from_slice(&digest.finalize()))
            }
            Self::SHA2_256 => {
                let mut digest = Sha256::new();
                data.iter().for_each(|chunk| digest.update(chunk));
                Ok(Array::from_slice(&digest.finalize()))
            }
            _ => Err("Unsupported hash algorithm".into()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::MD5 => write!(f, "MD5")?,
            Self::SHA1 => write!(f, "SHA1")?,
            Self::SHA2_256 => write!(f, "SHA2-256")?,
            _ => write!(f, "Unknown hash algorithm {}", self.0)?,
        }
        Ok(())
    }
}

// The keyed PRF is negotiated through the hash algorithm in IKEv1; HMAC is
// the only PRF family this implementation supports.
pub enum Prf {
    HmacMd5(HmacMd5),
    HmacSha1(HmacSha1),
    HmacSha256(HmacSha256),
}

impl Prf {
    pub fn init(hash: HashAlgorithm, key: &[u8]) -> Result<Prf, InitError> {
        match hash {
            HashAlgorithm::MD5 => {
                let hmac = HmacMd5::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC MD5 PRF"))?;
                Ok(Self::HmacMd5(hmac))
            }
            HashAlgorithm::SHA1 => {
                let hmac = HmacSha1::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC SHA1 PRF"))?;
                Ok(Self::HmacSha1(hmac))
            }
            HashAlgorithm::SHA2_256 => {
                let hmac = HmacSha256::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC SHA256 PRF"))?;
                Ok(Self::HmacSha256(hmac))
            }
            _ => Err("Unsupported PRF".into()),
        }
    }

    pub fn output_length(&self) -> usize {
        match self {
            Self::HmacMd5(_) => 128 / 8,
            Self::HmacSha1(_) => 160 / 8,
            Self::HmacSha256(_) => 256 / 8,
        }
    }

    pub fn digest(&self, data: &[&[u8]]) -> Array<MAX_PRF_OUTPUT_LENGTH> {
        match self {
            Self::HmacMd5(ref hmac) => {
                let mut hmac = hmac.clone();
                data.iter().for_each(|chunk| hmac.update(chunk));
                Array::from_slice(&hmac.finalize().into_bytes())
            }
            Self::HmacSha1(ref hmac) => {
                let mut hmac = hmac.clone();
                data.iter().for_each(|chunk| hmac.update(chunk));
                Array::from_slice(&hmac.finalize().into_bytes())
            }
            Self::HmacSha256(ref hmac) => {
                let mut hmac = hmac.clone();
                data.iter().for_each(|chunk| hmac.update(chunk));
                Array::from_slice(&hmac.finalize().into_bytes())
            }
        }
    }

    // Expands key material by chaining PRF blocks (K1 = prf(K, seed),
    // Kn = prf(K, Kn-1 | seed)) until the requested length is covered.
    pub fn expand(&self, seed: &[&[u8]], length: usize) -> KeyMaterial {
        let mut keys = Vec::with_capacity(length + self.output_length());
        let mut last_block = self.digest(seed);
        keys.extend_from_slice(last_block.as_slice());
        while keys.len() < length {
            let mut next_seed = Vec::with_capacity(last_block.len() + 64);
            next_seed.extend_from_slice(last_block.as_slice());
            seed.iter().for_each(|chunk| next_seed.extend_from_slice(chunk));
            last_block = self.digest(&[&next_seed]);
            next_seed.zeroize();
            keys.extend_from_slice(last_block.as_slice());
        }
        keys.truncate(length);
        KeyMaterial { keys }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    keys: Vec<u8>,
}

impl KeyMaterial {
    pub fn from_slice(src: &[u8]) -> KeyMaterial {
        KeyMaterial { keys: src.to_vec() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct EncryptionAlgorithm(u16);

// Oakley encryption algorithm identifiers from RFC 2409 Appendix A.
impl EncryptionAlgorithm {
    pub const DES_CBC: EncryptionAlgorithm = EncryptionAlgorithm(1);
    pub const TRIPLE_DES_CBC: EncryptionAlgorithm = EncryptionAlgorithm(5);
    pub const AES_CBC: EncryptionAlgorithm = EncryptionAlgorithm(7);

    pub fn from_u16(value: u16) -> EncryptionAlgorithm {
        EncryptionAlgorithm(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        *self == Self::AES_CBC
    }

    pub fn default_key_length(&self) -> Option<u16> {
        match *self {
            Self::AES_CBC => Some(128),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::DES_CBC => write!(f, "DES-CBC")?,
            Self::TRIPLE_DES_CBC => write!(f, "3DES-CBC")?,
            Self::AES_CBC => write!(f, "AES-CBC")?,
            _ => write!(f, "Unknown encryption algorithm {}", self.0)?,
        }
        Ok(())
    }
}

pub enum Cipher {
    Aes128Cbc(KeyMaterial),
    Aes192Cbc(KeyMaterial),
    Aes256Cbc(KeyMaterial),
}

impl Cipher {
    pub fn init(
        algorithm: EncryptionAlgorithm,
        key_length: Option<u16>,
        key: &[u8],
    ) -> Result<Cipher, InitError> {
        match algorithm {
            EncryptionAlgorithm::AES_CBC => {
                let key_length = key_length.unwrap_or(128) as usize / 8;
                if key.len() < key_length {
                    return Err("AES key material is too short".into());
                }
                let key = KeyMaterial::from_slice(&key[..key_length]);
                match key_length * 8 {
                    128 => Ok(Cipher::Aes128Cbc(key)),
                    192 => Ok(Cipher::Aes192Cbc(key)),
                    256 => Ok(Cipher::Aes256Cbc(key)),
                    _ => Err("Unsupported AES key length".into()),
                }
            }
            _ => Err("Unsupported encryption algorithm".into()),
        }
    }

    pub fn key_length(&self) -> usize {
        match self {
            Self::Aes128Cbc(_) => 128 / 8,
            Self::Aes192Cbc(_) => 192 / 8,
            Self::Aes256Cbc(_) => 256 / 8,
        }
    }

    pub fn block_length(&self) -> usize {
        16
    }

    // Encrypts in place; data must already be padded to the block length.
    pub fn encrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % self.block_length() != 0 {
            return Err("Encrypted data is not padded to cipher block length".into());
        }
        let data_len = data.len();
        let result = match self {
            Self::Aes128Cbc(ref key) => {
                Aes128CbcEnc::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| CryptoError::from("Failed to init AES-128-CBC"))?
                    .encrypt_padded_mut::<NoPadding>(data, data_len)
                    .map(|_| ())
            }
            Self::Aes192Cbc(ref key) => {
                Aes192CbcEnc::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| CryptoError::from("Failed to init AES-192-CBC"))?
                    .encrypt_padded_mut::<NoPadding>(data, data_len)
                    .map(|_| ())
            }
            Self::Aes256Cbc(ref key) => {
                Aes256CbcEnc::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| CryptoError::from("Failed to init AES-256-CBC"))?
                    .encrypt_padded_mut::<NoPadding>(data, data_len)
                    .map(|_| ())
            }
        };
        result.map_err(|_| "Failed to encrypt data".into())
    }

    pub fn decrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % self.block_length() != 0 {
            debug!("Ciphertext length {} is not a block multiple", data.len());
            return Err("Ciphertext is not padded to cipher block length".into());
        }
        let result = match self {
            Self::Aes128Cbc(ref key) => {
                Aes128CbcDec::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| CryptoError::from("Failed to init AES-128-CBC"))?
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map(|_| ())
            }
            Self::Aes192Cbc(ref key) => {
                Aes192CbcDec::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| CryptoError::from("Failed to init AES-192-CBC"))?
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map(|_| ())
            }
            Self::Aes256Cbc(ref key) => {
                Aes256CbcDec::new_from_slices(key.as_slice(), iv)
                    .map_err(|_| CryptoError::from("Failed to init AES-256-CBC"))?
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map(|_| ())
            }
        };
        result.map_err(|_| "Failed to decrypt data".into())
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DhGroup(u16);

impl DhGroup {
    pub const MODP_768: DhGroup = DhGroup(1);
    pub const MODP_1024: DhGroup = DhGroup(2);
    pub const MODP_1536: DhGroup = DhGroup(5);
    pub const MODP_2048: DhGroup = DhGroup(14);

    pub fn from_u16(value: u16) -> DhGroup {
        DhGroup(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        matches!(*self, Self::MODP_1024 | Self::MODP_2048)
    }
}

impl fmt::Display for DhGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::MODP_768 => write!(f, "MODP 768")?,
            Self::MODP_1024 => write!(f, "MODP 1024")?,
            Self::MODP_1536 => write!(f, "MODP 1536")?,
            Self::MODP_2048 => write!(f, "MODP 2048")?,
            _ => write!(f, "Unknown DH group {}", self.0)?,
        }
        Ok(())
    }
}

impl_modulus!(
    DhModulus1024,
    U1024,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
     020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
     4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
     EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
);

impl_modulus!(
    DhModulus2048,
    U2048,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
     020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
     4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
     EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
     98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
     9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
     E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
     3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

type Residue1024 = crypto_bigint::modular::constant_mod::Residue<DhModulus1024, { U1024::LIMBS }>;
type Residue2048 = crypto_bigint::modular::constant_mod::Residue<DhModulus2048, { U2048::LIMBS }>;

const DH_GENERATOR_1024: U1024 = U1024::from_u8(2);
const DH_GENERATOR_2048: U2048 = U2048::from_u8(2);
const DH_RESIDUE_1024: Residue1024 = const_residue!(DH_GENERATOR_1024, DhModulus1024);
const DH_RESIDUE_2048: Residue2048 = const_residue!(DH_GENERATOR_2048, DhModulus2048);

pub trait DhTransform {
    fn read_public_key(&self) -> Array<MAX_DH_KEY_LENGTH>;

    fn key_length_bytes(&self) -> usize;

    fn group(&self) -> DhGroup;

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Array<MAX_DH_KEY_LENGTH>, CryptoError>;
}

pub enum DhTransformType {
    Modp1024(DhTransformModp1024),
    Modp2048(DhTransformModp2048),
}

impl DhTransformType {
    pub fn init(group: DhGroup) -> Result<DhTransformType, InitError> {
        match group {
            DhGroup::MODP_1024 => {
                let private_key = U1024::random(&mut OsRng);
                let public_key = DH_RESIDUE_1024.pow(&private_key).retrieve();
                Ok(DhTransformType::Modp1024(DhTransformModp1024 {
                    private_key,
                    public_key,
                }))
            }
            DhGroup::MODP_2048 => {
                let private_key = U2048::random(&mut OsRng);
                let public_key = DH_RESIDUE_2048.pow(&private_key).retrieve();
                Ok(DhTransformType::Modp2048(DhTransformModp2048 {
                    private_key,
                    public_key,
                }))
            }
            _ => Err("Unsupported DH group".into()),
        }
    }
}

impl DhTransform for DhTransformType {
    fn read_public_key(&self) -> Array<MAX_DH_KEY_LENGTH> {
        match self {
            Self::Modp1024(ref dh) => dh.read_public_key(),
            Self::Modp2048(ref dh) => dh.read_public_key(),
        }
    }

    fn key_length_bytes(&self) -> usize {
        match self {
            Self::Modp1024(ref dh) => dh.key_length_bytes(),
            Self::Modp2048(ref dh) => dh.key_length_bytes(),
        }
    }

    fn group(&self) -> DhGroup {
        match self {
            Self::Modp1024(ref dh) => dh.group(),
            Self::Modp2048(ref dh) => dh.group(),
        }
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Array<MAX_DH_KEY_LENGTH>, CryptoError> {
        match self {
            Self::Modp1024(ref dh) => dh.compute_shared_secret(other_public_key),
            Self::Modp2048(ref dh) => dh.compute_shared_secret(other_public_key),
        }
    }
}

pub struct DhTransformModp1024 {
    private_key: U1024,
    public_key: U1024,
}

impl DhTransform for DhTransformModp1024 {
    fn read_public_key(&self) -> Array<MAX_DH_KEY_LENGTH> {
        Array::from_slice(&self.public_key.to_be_bytes())
    }

    fn key_length_bytes(&self) -> usize {
        1024 / 8
    }

    fn group(&self) -> DhGroup {
        DhGroup::MODP_1024
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Array<MAX_DH_KEY_LENGTH>, CryptoError> {
        if other_public_key.len() != self.key_length_bytes() {
            debug!(
                "MODP 1024 peer public value has length {}",
                other_public_key.len()
            );
            return Err("MODP 1024 key length is not valid".into());
        }
        let other_public_key = U1024::from_be_slice(other_public_key);
        let other_key_residue = const_residue!(other_public_key, DhModulus1024);
        let shared_key = other_key_residue.pow(&self.private_key).retrieve();
        Ok(Array::from_slice(&shared_key.to_be_bytes()))
    }
}

impl Drop for DhTransformModp1024 {
    fn drop(&mut self) {
        self.private_key = U1024::ZERO;
    }
}

pub struct DhTransformModp2048 {
    private_key: U2048,
    public_key: U2048,
}

impl DhTransform for DhTransformModp2048 {
    fn read_public_key(&self) -> Array<MAX_DH_KEY_LENGTH> {
        Array::from_slice(&self.public_key.to_be_bytes())
    }

    fn key_length_bytes(&self) -> usize {
        2048 / 8
    }

    fn group(&self) -> DhGroup {
        DhGroup::MODP_2048
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Array<MAX_DH_KEY_LENGTH>, CryptoError> {
        if other_public_key.len() != self.key_length_bytes() {
            debug!(
                "MODP 2048 peer public value has length {}",
                other_public_key.len()
            );
            return Err("MODP 2048 key length is not valid".into());
        }
        let other_public_key = U2048::from_be_slice(other_public_key);
        let other_key_residue = const_residue!(other_public_key, DhModulus2048);
        let shared_key = other_key_residue.pow(&self.private_key).retrieve();
        Ok(Array::from_slice(&shared_key.to_be_bytes()))
    }
}

impl Drop for DhTransformModp2048 {
    fn drop(&mut self) {
        self.private_key = U2048::ZERO;
    }
}

pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hash = Sha256::new();
    hash.update(data);
    hash.finalize().into()
}

#[derive(Debug)]
pub struct InitError {
    msg: &'static str,
}

impl InitError {
    pub fn new(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl error::Error for InitError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl From<&'static str> for InitError {
    fn from(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

#[derive(Debug)]
pub struct CryptoError {
    msg: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl error::Error for CryptoError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        CryptoError { msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prf_digest_is_deterministic() {
        let prf = Prf::init(HashAlgorithm::SHA1, &[0x0b; 20]).unwrap();
        let first = prf.digest(&[b"Hi There"]);
        let second = prf.digest(&[b"Hi ", b"There"]);
        assert_eq!(first.as_slice(), second.as_slice());
        // RFC 2202 test case 1.
        assert_eq!(
            first.as_slice(),
            [
                0xb6, 0x17, 0x31, 0x86, 0x55, 0x05, 0x72, 0x64, 0xe2, 0x8b, 0xc0, 0xb6, 0xfb,
                0x37, 0x8c, 0x8e, 0xf1, 0x46, 0xbe, 0x00
            ]
        );
    }

    #[test]
    fn prf_digest_changes_with_any_byte() {
        let prf = Prf::init(HashAlgorithm::SHA2_256, b"test key").unwrap();
        let base = prf.digest(&[b"canonical buffer"]);
        let changed = prf.digest(&[b"canonical buffer", &[0]]);
        assert_ne!(base.as_slice(), changed.as_slice());
        let changed = prf.digest(&[b"canonical buffeR"]);
        assert_ne!(base.as_slice(), changed.as_slice());
    }

    #[test]
    fn prf_expand_produces_requested_length() {
        let prf = Prf::init(HashAlgorithm::MD5, b"derivation key").unwrap();
        for length in [8, 16, 17, 48, 100] {
            let keymat = prf.expand(&[b"seed data"], length);
            assert_eq!(keymat.len(), length);
        }
        // The first block of a longer expansion matches a shorter one.
        let short = prf.expand(&[b"seed data"], 16);
        let long = prf.expand(&[b"seed data"], 64);
        assert_eq!(short.as_slice(), &long.as_slice()[..16]);
    }

    #[test]
    fn cipher_roundtrip() {
        let key = [0x42u8; 16];
        let cipher = Cipher::init(EncryptionAlgorithm::AES_CBC, Some(128), &key).unwrap();
        let iv = [0x24u8; 16];
        let mut data = *b"exactly 32 bytes of plaintext!!!";
        let original = data;
        cipher.encrypt(&iv, &mut data).unwrap();
        assert_ne!(data, original);
        cipher.decrypt(&iv, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn cipher_rejects_partial_blocks() {
        let cipher = Cipher::init(EncryptionAlgorithm::AES_CBC, Some(128), &[0u8; 16]).unwrap();
        let mut data = [0u8; 17];
        assert!(cipher.encrypt(&[0u8; 16], &mut data).is_err());
    }

    #[test]
    fn dh_shared_secret_matches() {
        let alice = DhTransformType::init(DhGroup::MODP_1024).unwrap();
        let bob = DhTransformType::init(DhGroup::MODP_1024).unwrap();
        let alice_shared = alice
            .compute_shared_secret(bob.read_public_key().as_slice())
            .unwrap();
        let bob_shared = bob
            .compute_shared_secret(alice.read_public_key().as_slice())
            .unwrap();
        assert_eq!(alice_shared.as_slice(), bob_shared.as_slice());
    }

    #[test]
    fn unsupported_dh_group_is_rejected() {
        assert!(DhTransformType::init(DhGroup::MODP_768).is_err());
    }
}
