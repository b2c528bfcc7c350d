//! Validated domain newtypes.

use nutype::nutype;

/// Name under which an agent registers with the name server.
///
/// Names are the routing keys of the whole system, so they are validated at
/// the boundary: non-empty, trimmed, and short enough to stay readable in
/// log output.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentName(String);

impl AgentName {
    /// Panicking constructor for statically known names.
    pub fn literal(name: &str) -> Self {
        Self::try_new(name.to_string()).expect("invalid agent name literal")
    }
}
