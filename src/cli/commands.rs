use crate::context::Request;
use crate::handler::Reply;
use crate::launcher::{Args, MethodDescriptor, ParamKind, ParamSpec, Singleton};
use crate::router::{Route, Router};
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::Suspend;
use crate::telemetry::{init_logging, LogConfig, LogFormat};
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use http::Method;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line interface for corouter
#[derive(Parser)]
#[command(name = "corouter")]
#[command(about = "Suspendable handlers on a coroutine router", long_about = None)]
pub struct Cli {
    /// Runtime configuration file (YAML); `COROUTER_*` variables still apply
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: json or pretty
    #[arg(long, global = true, env = "COROUTER_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive sample requests through suspending routes and print the responses
    Demo {
        /// How long the `/delay` handler stays suspended
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,

        /// Rounds of sample requests
        #[arg(short, long, default_value_t = 1)]
        requests: usize,
    },
    /// Print the effective runtime configuration
    Config,
}

/// Stand-in controller for the demo's controller-method route.
struct PetController;

impl PetController {
    fn get_pet(&self, args: Args, suspend: &Suspend) -> anyhow::Result<Reply> {
        let id = args.i64(0).unwrap_or_default();
        let verbose = args.bool(1).unwrap_or(false);

        // Callback-style lookup completed from another thread.
        let name: String = suspend.await_with(|continuation| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                let _ = continuation.resume(format!("pet-{id}"));
            });
        })?;

        let mut pet = json!({"id": id, "name": name});
        if verbose {
            pet["served_by"] = Value::String(suspend.task_name().to_string());
        }
        Ok(pet.into())
    }
}

/// Router used by `corouter demo`.
pub fn demo_router(config: RuntimeConfig, delay: Duration) -> Router {
    let mut router = Router::with_config(config);

    let delayed = router.suspend(move |ctx, suspend| {
        suspend.delay(delay)?;
        Ok(Reply::text(ctx.request().path.clone()))
    });
    router.add_route(
        Route::builder(Method::GET, "/delay")
            .name("delay")
            .handler(delayed)
            .after(|ctx, outcome| {
                if let Some(result) = outcome.value().and_then(Value::as_str) {
                    ctx.set_header("X-Result", result);
                }
            })
            .build(),
    );

    let get_pet = router.mvc(
        Singleton::new(PetController),
        MethodDescriptor::new("PetController", "get_pet")
            .param(ParamSpec::path("id", ParamKind::Integer))
            .param(ParamSpec::query("verbose", ParamKind::Boolean).default_value(json!(false))),
        |controller: &PetController, args, _ctx, suspend| controller.get_pet(args, suspend),
    );
    router.get("/pets/{id}", get_pet);

    let failing = router.suspend(move |_ctx, suspend| {
        suspend.delay(delay)?;
        anyhow::bail!("backend unavailable")
    });
    router.get("/fail", failing);

    router
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path),
        None => Ok(RuntimeConfig::from_env()),
    }
}

fn run_demo(config: RuntimeConfig, delay_ms: u64, rounds: usize) -> anyhow::Result<()> {
    let delay = Duration::from_millis(delay_ms);
    let wait = delay * 4 + Duration::from_secs(1);
    let grace = config.shutdown_grace();
    let router = demo_router(config, delay);
    router.start();

    let targets = ["/delay", "/pets/7?verbose=true", "/pets/abc", "/fail", "/missing"];
    for round in 0..rounds {
        for target in targets {
            let ctx = router.dispatch(Request::get(target));
            let res = ctx
                .wait_response(wait)
                .with_context(|| format!("no response for {target} within {wait:?}"))?;
            println!(
                "[{round}] GET {target} -> {} {}{}",
                res.status,
                res.body,
                res.get_header("x-result")
                    .map(|v| format!(" (X-Result: {v})"))
                    .unwrap_or_default()
            );
        }
    }

    let snapshot = router.scheduler().metrics().snapshot();
    println!(
        "tasks: launched={} completed={} failed={} cancelled={}",
        snapshot.launched, snapshot.completed, snapshot.failed, snapshot.cancelled
    );
    router.stop(grace)?;
    Ok(())
}

/// Parse arguments and run the selected command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, logging cannot be
/// initialised, or a demo request gets no response in time.
pub fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { delay_ms, requests } => {
            let log = LogConfig {
                format: LogFormat::parse(&cli.log_format),
                ..LogConfig::from_env()
            };
            init_logging(&log)?;
            run_demo(config, delay_ms, requests)
        }
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}
