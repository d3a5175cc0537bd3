//! Background tasks behind a [`Link`](crate::ws_client::Link).

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
