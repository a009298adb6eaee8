// src/main.rs
//
// Process entry point: pick the profile from the environment, wire the
// stream store and the default model/tool seams, and poll until a
// termination signal arrives. Exit code 0 on graceful shutdown, non-zero on
// unrecoverable startup errors (unknown profile, missing messaging env).

use std::process;
use std::sync::Arc;

use quadracode::config::{PROFILE_ENV_VAR, STREAM_URL_ENV_VAR};
use quadracode::model::EchoModel;
use quadracode::profiles::load_profile;
use quadracode::runtime::{create_runtime, run_forever};
use quadracode::store::HttpLogStore;
use quadracode::tools::local_tools;

#[tokio::main]
async fn main() {
    env_logger::init();

    let profile_name =
        std::env::var(PROFILE_ENV_VAR).unwrap_or_else(|_| "orchestrator".to_string());
    let profile = match load_profile(&profile_name) {
        Ok(profile) => profile,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };

    let stream_url = match std::env::var(STREAM_URL_ENV_VAR) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!(
                "{} must point at the stream-store endpoint",
                STREAM_URL_ENV_VAR
            );
            process::exit(2);
        }
    };

    // EchoModel is the stand-in seam; deployments bind their provider client
    // here.
    let runner = match create_runtime(profile)
        .with_model(Arc::new(EchoModel::new()))
        .with_store(Arc::new(HttpLogStore::new(stream_url)))
        .with_tools(local_tools())
        .build()
    {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };

    if let Err(err) = run_forever(Arc::new(runner)).await {
        log::error!("runtime exited with error: {}", err);
        process::exit(1);
    }
}
