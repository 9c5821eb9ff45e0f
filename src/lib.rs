//! Test-execution harness for kernel regression tests.
//!
//! A test program builds a [`TestContext`] from its arguments, installs
//! fault handling, creates a scratch workspace and loops its body, reporting
//! every checkpoint as an [`Outcome`]. Namespace tests run their child logic
//! through an [`IsolationRunner`], which keeps "could not isolate" apart from
//! "the child's checks failed".

pub mod cli;
pub mod context;
pub mod environment;
pub mod handshake;
pub mod isolation;
pub mod looping;
pub mod namespaces;
pub mod results;
pub mod scripts;
pub mod signals;
pub mod syscall;
pub mod workspace;

pub use cli::{Config, ConfigParser, OptionSpec, ParseError};
pub use context::TestContext;
pub use environment::Environment;
pub use handshake::{HandshakeChannel, HandshakeError, SetupResultChannel};
pub use isolation::{
    ChildExit, ChildProcess, IsolationError, IsolationRunner, IsolationStrategy, KernelBackend,
    NamespaceBackend, RunOutcome,
};
pub use looping::LoopState;
pub use namespaces::{Namespace, NamespaceSet};
pub use results::{Flow, Outcome, OutputMode, ResultAggregator, ResultKind};
pub use scripts::{ScriptError, ScriptRunner};
pub use signals::{ForkMode, SignalError, SignalTable};
pub use syscall::{capture, SyscallResult, TimingStats};
pub use workspace::{TempWorkspace, WorkspaceError};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the stderr log subscriber, filtered by `RUST_LOG`.
///
/// Result lines go to stdout and are not affected. Calling this more than
/// once is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init();
}
