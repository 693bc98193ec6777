use http::Response;

/// A response head: status, version and headers, with the body still detached.
pub type ResponseHead = Response<()>;
