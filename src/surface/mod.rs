pub mod handlers;
pub mod logging;
pub mod router;

pub use router::{build_router, AppState};
