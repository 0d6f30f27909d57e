use std::sync::Arc;

use crate::MemOpResult;
use crate::engine::{PatchEngine, PatchReport, TargetOs};

#[cfg(feature = "async")]
#[macro_export]
/// Clones `$handle` into a `smol::unblock` closure and awaits it.
/// Lets the blocking ptrace and `/proc` calls run from async code.
macro_rules! await_memop {
    (
        $handle:expr,
        $body:expr
    ) => {{
        let handle_clone = $handle.clone();

        smol::unblock(move || -> $crate::MemOpResult<_> { $body(handle_clone) }).await
    }};
}

#[cfg(feature = "async")]
/// Runs [`PatchEngine::run`] on smol's blocking pool.
///
/// Dropping the future does not stop the run; fire the engine's
/// [`CancelToken`](crate::engine::CancelToken) for that.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use sigpatch::engine::{EngineConfig, PatchEngine, PatchSpec};
/// use sigpatch::process::LinuxTarget;
///
/// let spec = PatchSpec::parse("66 0F D6 83 ?? 02 00 00", "90 90 90 90 90 90 90 90")?;
/// let engine = Arc::new(PatchEngine::new(
///     LinuxTarget::new(),
///     vec![spec],
///     EngineConfig::new("game", "client.so"),
/// )?);
///
/// let report = smol::block_on(sigpatch::async_ext::run_async(engine))?;
/// println!("{:?}", report.state);
/// # Ok::<(), sigpatch::MemOpError>(())
/// ```
pub async fn run_async<T>(engine: Arc<PatchEngine<T>>) -> MemOpResult<PatchReport>
where
    T: TargetOs + Send + Sync + 'static,
{
    crate::await_memop!(engine, |e: Arc<PatchEngine<T>>| -> MemOpResult<PatchReport> { e.run() })
}
