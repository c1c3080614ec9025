//! Tool dispatch for the MOSS protocol.
//!
//! Parses the stage-1 command list and fans each `Action("arg")` out to the
//! external search / calculator / solver / text-to-image services:
//! - [`command`]: payload parsing and validation
//! - [`backend`]: HTTP clients for the tool services
//! - [`dispatcher`]: concurrent execution and result joining

pub mod backend;
pub mod command;
pub mod dispatcher;

pub use backend::{HttpToolBackend, SearchHit, ToolBackend};
pub use dispatcher::{ToolDispatcher, ToolOutput, DRAW_RESULT, NONE_RESULT};
