use hub_domain::error::Error;

/// Map a transport-level reqwest failure onto the shared taxonomy.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    Error::external("gemini", e.to_string())
}
