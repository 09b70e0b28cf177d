//! bgserve demo
//!
//! Starts a background service, lists it, pushes an auth key, stops it,
//! then runs a second one in blocking mode until Ctrl-C.
//!
//! # Environment Variables
//!
//! - `BGSERVE_LOG=debug` - log filter (default info)
//! - `BGSERVE_DEMO_DIR=/srv/www` - directory to serve (default `.`)
//! - `BGSERVE_DEMO_ADDR=127.0.0.1:8080` - bind address
//! - `BGSERVE_DEMO_AUTH_KEY=secret` - key pushed to the first service
//!
//! BGSERVE_LOG=debug cargo run -p bgserve-demo

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bgserve::env::{env_get, env_get_opt};
use bgserve::{AuthAction, PipeRuntime, ServeConfig, ServeHost, SignalInterrupt, StartOptions, Started};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("BGSERVE_LOG")
                .from_env_lossy(),
        )
        .init();

    let dir: String = env_get("BGSERVE_DEMO_DIR", ".".to_string());
    let addr: String = env_get("BGSERVE_DEMO_ADDR", "127.0.0.1:8080".to_string());
    let auth_key: Option<String> = env_get_opt("BGSERVE_DEMO_AUTH_KEY");

    let runtime = Arc::new(PipeRuntime::new());
    let host = ServeHost::new(runtime.clone());

    println!("=== background ===");
    let config = ServeConfig::new().mount(dir.clone(), "/").addr(addr.clone()).auth(true);
    let started = host.start(
        config,
        StartOptions::new().on_log(|h, line, _| {
            print!("[server {}] {line}", h.server().unwrap_or_default());
            Ok(())
        }),
    )?;
    let Some(handle) = started.into_handle() else {
        return Ok(());
    };

    host.run_until_idle(Duration::from_millis(100))?;
    for info in host.list() {
        println!("{info}");
    }

    if let Some(key) = auth_key {
        let status = host.manage_auth(&handle, &key, AuthAction::Add)?;
        println!("auth {status}, keys: {:?}", host.list_auth_keys(&handle)?);
    }

    host.shutdown(&handle)?;
    tracing::info!(server = handle.id(), remote_keys = ?runtime.remote_keys(handle.id()), "first service done");

    println!("\n=== blocking (Ctrl-C to stop) ===");
    let config = ServeConfig::new().mount(dir, "/").addr(addr);
    let started = host.start(
        config,
        StartOptions::new()
            .blocking(true)
            .interrupt(SignalInterrupt::install()?)
            .on_log(|_h, line, _| {
                print!("{line}");
                Ok(())
            }),
    )?;
    if let Started::Stopped(exit) = started {
        println!("blocking run ended: {exit:?}");
    }
    Ok(())
}
