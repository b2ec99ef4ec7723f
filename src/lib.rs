pub mod calc;
pub mod ctt;
pub mod matrix;

pub(crate) mod config;
pub(crate) mod db;
pub(crate) mod ipc;
pub(crate) mod telemetry;

use std::io::{self, BufRead, Write};

/// Serves newline-delimited JSON requests from stdin until it closes.
pub fn run() -> anyhow::Result<()> {
    let settings = config::Settings::from_env()?;
    telemetry::init_tracing(&settings)?;

    let mut state = ipc::AppState::new(settings.clamp_policy);
    if let Some(ws) = settings.workspace.as_deref() {
        // A bad startup workspace is not fatal; the client can select another.
        if let Err(e) = ipc::select_workspace(&mut state, ws) {
            tracing::error!(workspace = %ws.to_string_lossy(), error = %format!("{e:#}"), "failed to open startup workspace");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "raportd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // No id to echo back when the line does not parse.
            Err(e) => ipc::err("", "bad_json", e.to_string(), None),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}
