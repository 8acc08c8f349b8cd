//! evalkit sandbox - sandboxed code evaluation
//!
//! Runs untrusted script snippets either inside a hosted isolate (one
//! interpreter per isolate id, tracked by [`IsolateRegistry`]) or in an
//! in-process fallback interpreter. Both paths return the same
//! [`EvaluationResult`] shape.

mod bindings;
mod config;
mod db;
mod dispatch;
mod document;
mod error;
mod evaluator;
mod fallback;
mod fetch;
mod limits;
mod normalize;
mod platform;
mod policy;
mod registry;
mod runtime;
mod types;
mod typescript;

pub use bindings::{validate_binding_name, BindingSet, BindingValue, HostFunction, PreparedBindings};
pub use config::{EngineConfig, EvaluationConfig, IsolateSettings};
pub use db::{glob_to_regex, DbContext, DbError, Document, MemoryDb, ReadOnlyDb};
pub use dispatch::{select_path, DispatchDecision, EvaluationPhase, ExecutionPath};
pub use document::CompiledDocument;
pub use error::{Result, SandboxError};
pub use evaluator::{Evaluator, EvaluatorBuilder};
pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher, PolicyFetcher};
pub use limits::ResourceLimits;
pub use platform::{
    ConfigFactory, Invocation, InvocationReply, IsolateConfig, IsolateInstance, IsolateRequest,
    IsolateResponse, IsolationPlatform, ThreadIsolatePlatform, DEFAULT_COMPATIBILITY_DATE,
};
pub use policy::{NetworkPosture, SecurityPolicy, TrustLevel};
pub use registry::{IsolateEntry, IsolateHandle, IsolateRegistry};
pub use types::{
    ConsoleEntry, ConsoleLevel, ErrorInfo, EvaluateOptions, EvaluationResult, SourceKind,
    SourceUnit,
};
pub use typescript::strip_types;
