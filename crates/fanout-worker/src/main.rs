//! Fanout worker process.
//!
//! Spawned by `ProcessWorkerFactory`; speaks the length-prefixed rkyv
//! protocol on stdin/stdout. Set `RUST_LOG` to see its logs on stderr.

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = fanout_worker::builtins::registry();
    tracing::debug!("Worker {} serving {} tasks", std::process::id(), registry.len());

    fanout_worker::run(&registry).map_err(|e| {
        tracing::error!("Worker failed: {}", fanout_worker::render_error(&e));
        e
    })
}
