//! Request to reply header propagation.

use nr_common::{
    Headers, HEADER_BAGGAGE, HEADER_CORRELATION_ID, HEADER_TRACE_PARENT, HEADER_TRACE_STATE,
};

/// Headers copied from a request onto its reply. Nothing else crosses over.
pub const PROPAGATED_HEADERS: [&str; 4] = [
    HEADER_CORRELATION_ID,
    HEADER_TRACE_PARENT,
    HEADER_TRACE_STATE,
    HEADER_BAGGAGE,
];

/// Append every value of the allow-listed request headers to `reply`
pub fn propagate_headers(request: &Headers, reply: &mut Headers) {
    for (name, values) in request.iter() {
        if PROPAGATED_HEADERS.contains(&name) {
            for value in values {
                reply.append(name, value.as_str());
            }
        }
    }
}
