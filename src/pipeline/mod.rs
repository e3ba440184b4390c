//! Per-request pipeline: admission control, downstream invocation and
//! outcome logging.

mod downstream;
mod outcome;
mod request;
mod service;

pub use downstream::{Downstream, DownstreamError, UpstreamForwarder};
pub use outcome::RequestOutcome;
pub use request::{BodyError, ClientRequest, PipelineResponse, RATE_LIMITED_BODY};
pub use service::{Handled, RequestPipeline};
