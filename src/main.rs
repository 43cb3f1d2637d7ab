use std::{
    env, fmt,
    future::{self, Future},
    net::{IpAddr, Ipv4Addr},
    pin::pin,
    process,
    str::FromStr,
    task::Poll,
    time::Duration,
};

use log::{debug, info, warn};
use rand::Rng;
use tokio::{runtime, signal, sync::mpsc};

mod ikev1;
mod logger;

use ikev1::{
    AuthAlgorithm, AuthenticationMethod, CheckLevel, DhGroup, DpdConfig, EncapsulationMode,
    EncryptionAlgorithm, ExchangeType, HashAlgorithm, IpsecTransform, IsakmpTransform, Lifetime,
    Phase1Policy, Phase2Policy, PolicySnapshot, ProtocolId, ProtocolProposal, RetransmitConfig,
    SaProposal, Selector, ESP_TRANSFORM_AES, ESP_TRANSFORM_3DES,
};

enum Action {
    Serve(ikev1::Config, bool),
}

enum Interrupt {
    Shutdown,
    Reload,
    Dump,
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: oakleyd [OPTIONS] serve\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --listen-ip=<IP>                 Listen IP address, multiple options can be provided [default: 0.0.0.0]\
\n      --port=<PORT>                    ISAKMP UDP port [default: 500]\
\n      --psk=<KEY>                      Pre-shared key (required)\
\n      --local-net=<ADDR[/PREFIX]>      Local traffic selector (required)\
\n      --remote-net=<ADDR[/PREFIX]>     Remote traffic selector; its address is the peer gateway (required)\
\n      --exchange-mode=<MODE>           Phase 1 mode: main, aggressive or base [default: main]\
\n      --check-level=<LEVEL>            Proposal check level: obey, strict, claim or exact [default: obey]\
\n      --lifetime=<SECONDS>             Phase 1 lifetime [default: 28800]\
\n      --ipsec-lifetime=<SECONDS>       Phase 2 lifetime [default: 3600]\
\n      --pfs-group=<GROUP>              Quick Mode PFS group: 1024 or 2048 [default: off]\
\n      --dpd-interval=<SECONDS>         Dead peer detection interval, 0 disables [default: 0]\
\n      --initiate                       Start negotiating with the peer immediately\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let mut log_level = log::LevelFilter::Info;
        let mut listen_ips = vec![];
        let mut port = 500u16;
        let mut psk = None;
        let mut local_net = None;
        let mut remote_net = None;
        let mut exchange_type = ExchangeType::IDENTITY_PROTECTION;
        let mut check_level = CheckLevel::Obey;
        let mut lifetime = 28800u32;
        let mut ipsec_lifetime = 3600u32;
        let mut pfs_group = None;
        let mut dpd_interval = 0u64;
        let mut initiate = false;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            if arg == "--initiate" {
                initiate = true;
                continue;
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => {
                        listen_ips.push(ip);
                    }
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--port" {
                match value.parse::<u16>() {
                    Ok(value) => port = value,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse port: {}", err))
                    }
                };
            } else if name == "--psk" {
                psk = Some(value.as_bytes().to_vec());
            } else if name == "--local-net" {
                match parse_selector(value) {
                    Ok(selector) => local_net = Some(selector),
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--remote-net" {
                match parse_selector(value) {
                    Ok(selector) => remote_net = Some(selector),
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--exchange-mode" {
                exchange_type = match value {
                    "main" => ExchangeType::IDENTITY_PROTECTION,
                    "aggressive" => ExchangeType::AGGRESSIVE,
                    "base" => ExchangeType::BASE,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported exchange mode"));
                        process::exit(2);
                    }
                };
            } else if name == "--check-level" {
                check_level = match CheckLevel::from_str(value) {
                    Some(level) => level,
                    None => {
                        fail_with_error(name, value, format_args!("Unsupported check level"));
                        process::exit(2);
                    }
                };
            } else if name == "--lifetime" {
                match value.parse::<u32>() {
                    Ok(value) => lifetime = value,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse lifetime: {}", err),
                    ),
                };
            } else if name == "--ipsec-lifetime" {
                match value.parse::<u32>() {
                    Ok(value) => ipsec_lifetime = value,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse lifetime: {}", err),
                    ),
                };
            } else if name == "--pfs-group" {
                pfs_group = match value {
                    "1024" => Some(DhGroup::MODP_1024),
                    "2048" => Some(DhGroup::MODP_2048),
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported PFS group"));
                        process::exit(2);
                    }
                };
            } else if name == "--dpd-interval" {
                match value.parse::<u64>() {
                    Ok(value) => dpd_interval = value,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse interval: {}", err),
                    ),
                };
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "serve" => {
                let (psk, local_net, remote_net) = match (psk, local_net, remote_net) {
                    (Some(psk), Some(local_net), Some(remote_net)) => (psk, local_net, remote_net),
                    _ => {
                        eprintln!("--psk, --local-net and --remote-net are required");
                        println!("{}", USAGE_INSTRUCTIONS);
                        process::exit(2);
                    }
                };
                if listen_ips.is_empty() {
                    listen_ips = vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)];
                }
                let policy = build_policy(
                    psk,
                    local_net,
                    remote_net,
                    exchange_type,
                    check_level,
                    lifetime,
                    ipsec_lifetime,
                    pfs_group,
                    dpd_interval,
                );
                let action = Action::Serve(
                    ikev1::Config {
                        port,
                        listen_ips,
                        policy,
                    },
                    initiate,
                );
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn parse_selector(value: &str) -> Result<Selector, String> {
    let (addr, prefix_len) = match value.split_once('/') {
        Some((addr, prefix)) => {
            let addr = IpAddr::from_str(addr)
                .map_err(|err| format!("Failed to parse IP address: {}", err))?;
            let prefix_len = prefix
                .parse::<u8>()
                .map_err(|err| format!("Failed to parse prefix length: {}", err))?;
            (addr, prefix_len)
        }
        None => {
            let addr = IpAddr::from_str(value)
                .map_err(|err| format!("Failed to parse IP address: {}", err))?;
            let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
            (addr, prefix_len)
        }
    };
    let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
    if prefix_len > max_prefix {
        return Err(format!("Prefix length {} is too long", prefix_len));
    }
    Ok(Selector { addr, prefix_len })
}

#[allow(clippy::too_many_arguments)]
fn build_policy(
    psk: Vec<u8>,
    local_net: Selector,
    remote_net: Selector,
    exchange_type: ExchangeType,
    check_level: CheckLevel,
    lifetime: u32,
    ipsec_lifetime: u32,
    pfs_group: Option<DhGroup>,
    dpd_interval: u64,
) -> PolicySnapshot {
    let dpd = if dpd_interval > 0 {
        Some(DpdConfig {
            interval: Duration::from_secs(dpd_interval),
            ..Default::default()
        })
    } else {
        None
    };
    PolicySnapshot {
        version: 1,
        check_level,
        phase1: Phase1Policy {
            exchange_types: vec![exchange_type],
            candidates: vec![
                IsakmpTransform {
                    number: 1,
                    encryption: EncryptionAlgorithm::AES_CBC,
                    key_length: Some(128),
                    hash: HashAlgorithm::SHA2_256,
                    auth_method: AuthenticationMethod::PRE_SHARED_KEY,
                    group: DhGroup::MODP_2048,
                    life: Lifetime::seconds(lifetime),
                },
                IsakmpTransform {
                    number: 2,
                    encryption: EncryptionAlgorithm::AES_CBC,
                    key_length: Some(128),
                    hash: HashAlgorithm::SHA1,
                    auth_method: AuthenticationMethod::PRE_SHARED_KEY,
                    group: DhGroup::MODP_1024,
                    life: Lifetime::seconds(lifetime),
                },
            ],
            pre_shared_key: psk,
            lifetime: Lifetime::seconds(lifetime),
            dpd,
        },
        phase2: vec![Phase2Policy {
            id: 1,
            local: local_net,
            remote: remote_net,
            proposal: SaProposal {
                number: 1,
                protocols: vec![ProtocolProposal {
                    protocol: ProtocolId::ESP,
                    spi: vec![0, 0, 0, 0],
                    transforms: vec![
                        IpsecTransform {
                            number: 1,
                            transform_id: ESP_TRANSFORM_AES,
                            auth: Some(AuthAlgorithm::HMAC_SHA1),
                            encapsulation: EncapsulationMode::TUNNEL,
                            key_length: Some(128),
                            group: pfs_group,
                            life: Lifetime::seconds(ipsec_lifetime),
                        },
                        IpsecTransform {
                            number: 2,
                            transform_id: ESP_TRANSFORM_3DES,
                            auth: Some(AuthAlgorithm::HMAC_SHA1),
                            encapsulation: EncapsulationMode::TUNNEL,
                            key_length: None,
                            group: pfs_group,
                            life: Lifetime::seconds(ipsec_lifetime),
                        },
                    ],
                }],
            },
            lifetime: Lifetime::seconds(ipsec_lifetime),
        }],
        retransmit: RetransmitConfig::default(),
    }
}

// Stand-in for a PF_KEY/netlink SA store: hands out SPIs and logs what a
// kernel would install or remove.
async fn run_sadb_store(
    mut requests: mpsc::Receiver<ikev1::SadbRequest>,
    events: mpsc::Sender<ikev1::SadbEvent>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            ikev1::SadbRequest::GetSpi {
                sequence,
                protocol,
                src,
                dst,
            } => {
                // SPIs below 256 are reserved.
                let mut spi = [0u8; 4];
                while u32::from_be_bytes(spi) < 256 {
                    rand::thread_rng().fill(&mut spi);
                }
                debug!(
                    "Allocated {} SPI {} for {} -> {}",
                    protocol,
                    logger::fmt_slice_hex(&spi),
                    src,
                    dst
                );
                let event = ikev1::SadbEvent::SpiAllocated {
                    sequence,
                    protocol,
                    spi: spi.to_vec(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            ikev1::SadbRequest::AddSa(install) => {
                info!(
                    "Installing {} SA {} ({} -> {})",
                    install.protocol,
                    logger::fmt_slice_hex(&install.spi),
                    install.src,
                    install.dst
                );
            }
            ikev1::SadbRequest::DeleteSa {
                protocol,
                spi,
                src,
                dst,
            } => {
                info!(
                    "Removing {} SA {} ({} -> {})",
                    protocol,
                    logger::fmt_slice_hex(&spi),
                    src,
                    dst
                );
            }
        }
    }
}

// Blocks until a shutdown, reload or dump request arrives.
async fn next_interrupt(
    hangup: &mut signal::unix::Signal,
    user1: &mut signal::unix::Signal,
) -> Result<Interrupt, ikev1::IkeError> {
    let mut interrupt = pin!(signal::ctrl_c());
    let mut reload = pin!(hangup.recv());
    let mut dump = pin!(user1.recv());
    let result = future::poll_fn(move |cx| {
        if let Poll::Ready(result) = interrupt.as_mut().poll(cx) {
            return Poll::Ready(result.map(|_| Interrupt::Shutdown));
        }
        if reload.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(Interrupt::Reload));
        }
        if dump.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(Interrupt::Dump));
        }
        Poll::Pending
    })
    .await?;
    Ok(result)
}

fn serve(config: ikev1::Config, initiate: bool) -> Result<(), ikev1::IkeError> {
    let base_policy = config.policy.clone();
    let selectors = config
        .policy
        .phase2
        .first()
        .map(|policy| (policy.local.addr, policy.remote.addr));
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut server = ikev1::Server::new(config);
    rt.block_on(async {
        let (sadb_tx, sadb_rx) = mpsc::channel(64);
        let (sadb_event_tx, sadb_event_rx) = mpsc::channel(64);
        tokio::spawn(run_sadb_store(sadb_rx, sadb_event_tx.clone()));
        let mut events = server.start(sadb_tx, sadb_event_rx).await?;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!("Session event: {:?}", event);
            }
        });
        if initiate {
            if let Some((src, dst)) = selectors {
                let acquire = ikev1::SadbEvent::Acquire {
                    sequence: 1,
                    policy_id: 1,
                    src,
                    dst,
                };
                if sadb_event_tx.send(acquire).await.is_err() {
                    return Err("SA/SPD event channel closed".into());
                }
            }
        }
        let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
        let mut user1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())?;
        let mut policy_version = base_policy.version;
        loop {
            match next_interrupt(&mut hangup, &mut user1).await? {
                Interrupt::Shutdown => break,
                Interrupt::Reload => {
                    // Settings come from the command line and cannot change
                    // underneath us; a reload revalidates live sessions
                    // against them.
                    policy_version += 1;
                    let mut policy = base_policy.clone();
                    policy.version = policy_version;
                    info!("Reloading policy (version {})", policy_version);
                    server.reconfigure(policy).await?;
                }
                Interrupt::Dump => match server.dump_sessions().await {
                    Ok(dump) => println!("{}", dump),
                    Err(err) => warn!("Failed to dump sessions: {}", err),
                },
            }
        }
        info!("Shutting down");
        server.terminate().await
    })?;
    rt.shutdown_timeout(Duration::from_secs(60));

    info!("Stopped server");
    Ok(())
}

fn main() {
    println!(
        "Oakleyd version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(config, initiate) => {
            if let Err(err) = serve(config, initiate) {
                println!("Failed to run server, error is {}", err);
                std::process::exit(1);
            }
        }
    }
}
