//! Termination signals for worker processes
//!
//! A worker stops on Ctrl-C, on SIGTERM, or (when supervised) when its stdin
//! pipe closes. The supervisor asks for a graceful stop by closing the pipe.

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Returns a token cancelled on the first termination signal
///
/// # Arguments
///
/// * `watch_stdin` - Also treat end-of-file on stdin as a stop request
pub fn shutdown_token(watch_stdin: bool) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let reason = wait_for_signal(watch_stdin).await;
        tracing::info!("Shutdown requested ({})", reason);
        trigger.cancel();
    });

    token
}

async fn wait_for_signal(watch_stdin: bool) -> &'static str {
    tokio::select! {
        _ = ctrl_c() => "interrupt",
        _ = terminate() => "terminate",
        _ = stdin_closed(), if watch_stdin => "stdin closed",
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Resolves once stdin reaches end-of-file or fails
async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
