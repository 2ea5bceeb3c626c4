#![deny(unsafe_code)]
use anyhow::{Context, Result, bail};
use clap::Parser;
use cordon_agent::{AppState, build_app, worker::spawn_workers};
use cordon_approval::ApprovalStore;
use cordon_audit::AuditStore;
use cordon_config::{PolicyConfig, load_agent_config, load_policy_config};
use cordon_policy::CheckChain;
use cordon_policy::plugin::global_registry;
use cordon_redact::SecretRedactor;
use cordon_sandbox::docker::DockerSandbox;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cordon-agent", version, about = "Cordon execution agent")]
struct Args {
    /// Agent configuration file (YAML).
    #[arg(long, default_value = "cordon-agent.yaml")]
    config: PathBuf,

    /// Policy configuration file (YAML). Optional; defaults apply.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Bind address override (defaults to 0.0.0.0:<config port>).
    #[arg(long)]
    bind: Option<String>,

    /// Serve plain HTTP even without TLS material. Development only.
    #[arg(long)]
    allow_insecure: bool,

    /// Enable request/job debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("cordon=debug,cordon_agent=debug")
    } else {
        EnvFilter::new("cordon=info,cordon_agent=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) =
        load_agent_config(&args.config).with_context(|| format!("load {}", args.config.display()))?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    if !config.tls_enabled() && !args.allow_insecure {
        bail!(
            "refusing to serve plain HTTP: set tls_cert_file/tls_key_file, \
             or pass --allow-insecure for development"
        );
    }

    let policy = match &args.policy {
        Some(path) => {
            load_policy_config(path).with_context(|| format!("load {}", path.display()))?
        }
        None => PolicyConfig::default(),
    };

    let mut redactor = SecretRedactor::new();
    for pattern in &policy.secrets.extra_patterns {
        redactor
            .register(pattern)
            .with_context(|| format!("register secret pattern {pattern:?}"))?;
    }

    let chain = CheckChain::new(&policy, Arc::clone(global_registry()))
        .context("compile policy chain")?;
    let audit = AuditStore::open(Path::new(&config.audit_db_path), redactor.clone())
        .with_context(|| format!("open audit db {}", config.audit_db_path))?;
    let approvals = ApprovalStore::open(Path::new(&config.approval_db_path))
        .with_context(|| format!("open approval db {}", config.approval_db_path))?;
    let sandbox = Arc::new(
        DockerSandbox::new()
            .context("connect to docker daemon")?
            .with_user(config.run_as_user, config.run_as_group),
    );

    let workers = config.max_concurrent_jobs;
    let (state, queue_rx) = AppState::new(config, chain, audit, approvals, sandbox);
    let handles = spawn_workers(Arc::clone(&state), queue_rx, workers);

    let bind = args
        .bind
        .unwrap_or_else(|| format!("0.0.0.0:{}", state.config.port));
    let addr: SocketAddr = bind.parse().with_context(|| format!("parse bind {bind}"))?;

    // Ctrl-C initiates graceful shutdown: running jobs are cancelled, the
    // finalizers still write their audit rows, then the listener closes.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                state.shutdown(Duration::from_secs(10)).await;
            }
        });
    }

    if state.config.tls_enabled() {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &state.config.tls_cert_file,
            &state.config.tls_key_file,
        )
        .await
        .context("load TLS material")?;
        info!(%addr, workers, "cordon-agent listening (tls)");
        let app = build_app(Arc::clone(&state));
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
            .context("serve tls")?;
    } else {
        warn!("serving PLAIN HTTP; development mode only");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!(%addr, workers, "cordon-agent listening");
        cordon_agent::serve(Arc::clone(&state), listener)
            .await
            .context("serve")?;
    }

    for handle in handles {
        handle.abort();
    }
    Ok(())
}
