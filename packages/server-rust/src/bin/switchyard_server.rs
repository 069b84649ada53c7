//! Demo server: an echo route, a whoami route and an echo socket namespace.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use switchyard_core::{
    EndpointConfig, ExecutionContext, Handler, Inputs, RateOptions, ResponseSpec,
};
use switchyard_server::{
    Application, ApplicationBuilder, CorsPolicy, DispatchConfig, FixedWindowLimiter,
    JwtAuthenticator, LoadConfig, NetworkConfig, NetworkModule, RouteConfig, Router,
    SocketListener,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "switchyard-server", version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0", env = "SWITCHYARD_HOST")]
    host: String,
    #[arg(long, default_value_t = 8080, env = "SWITCHYARD_PORT")]
    port: u16,
    /// Scheduler lag above which requests are shed, in milliseconds.
    #[arg(long, default_value_t = 70)]
    max_lag_ms: u64,
    /// Lag sampling interval, in milliseconds.
    #[arg(long, default_value_t = 500)]
    lag_interval_ms: u64,
    /// Per-invocation deadline in milliseconds; 0 disables it.
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
    /// HS256 secret. Without one, requests are not authenticated.
    #[arg(long, env = "SWITCHYARD_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(io::stderr().is_terminal()).init();
    }
}

async fn echo(inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
    Ok(Value::Object(inputs))
}

async fn whoami(_inputs: Inputs, ctx: ExecutionContext) -> anyhow::Result<Value> {
    Ok(match &ctx.auth {
        Some(auth) => json!({"owner": auth.owner, "claims": auth.claims}),
        None => json!({"owner": null}),
    })
}

fn build_app(args: &Args, limiter: Arc<FixedWindowLimiter>) -> anyhow::Result<Application> {
    let config = DispatchConfig {
        load: LoadConfig {
            interval: Duration::from_millis(args.lag_interval_ms),
            max_lag: Duration::from_millis(args.max_lag_ms),
            ..LoadConfig::default()
        },
        invocation_timeout: (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms)),
        ..DispatchConfig::default()
    };

    let mut routes = Router::new();
    routes
        .set(
            "/echo",
            RouteConfig::new()
                .get(Handler::action(echo))
                .post(
                    EndpointConfig::new(echo)
                        .rate(RateOptions::new(Duration::from_secs(60), 120))
                        .response(ResponseSpec::identity()),
                )
                .cors(CorsPolicy::any()),
        )
        .set("/whoami", RouteConfig::new().get(Handler::action(whoami)));

    let mut listener = SocketListener::new();
    listener.on("echo", Handler::action(echo));

    let mut builder = ApplicationBuilder::new(config)
        .rate_limiter(limiter)
        .settings(json!({"service": "switchyard-demo"}));
    builder = match &args.jwt_secret {
        Some(secret) => builder.authenticator(Arc::new(JwtAuthenticator::new(secret.as_bytes()))),
        None => builder,
    };
    Ok(builder
        .mount("/api", routes)?
        .listen("/echo", listener)?
        .build())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let limiter = Arc::new(FixedWindowLimiter::new());
    let mut janitor = limiter.start_janitor(Duration::from_secs(60));
    let app = build_app(&args, Arc::clone(&limiter))?;
    info!(namespaces = ?app.namespaces(), "application built");

    let mut module = NetworkModule::new(
        NetworkConfig {
            host: args.host.clone(),
            port: args.port,
            ..NetworkConfig::default()
        },
        app,
    );
    module.start().await?;
    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    janitor.stop().await;
    Ok(())
}
