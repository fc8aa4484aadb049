pub mod debug;
pub mod forwarder;
pub mod server;

pub use server::Server;

use http::StatusCode;

use crate::director::Director;
use crate::matcher::Matcher;

/// One row in the ordered routing table: a predicate deciding which
/// requests the rule claims, the rewrite that produces the outbound
/// request, and an optional redirect outcome.
#[derive(Debug)]
pub struct SiteRule {
    /// Stable display name for logs and the debug page.
    pub name: String,
    pub matcher: Matcher,
    pub director: Director,
    /// When set, the rule replies with this redirect status and the
    /// directed URL as Location instead of proxying.
    pub redirect: Option<StatusCode>,
}
