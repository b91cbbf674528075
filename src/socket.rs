//! The byte-stream socket contract between the embedder and the
//! coordinator.
//!
//! Sockets are created, polled and destroyed by the embedding I/O loop;
//! the coordinator only ever writes to them, asks them to shut down, and
//! hands them back through [`crate::VncServer::get_sockets`]. Identity is
//! the handle itself: two [`SocketRef`]s refer to the same socket exactly
//! when they point at the same object.

use std::io;
use std::rc::Rc;

/// A non-blocking byte-stream socket owned by the embedder.
pub trait Socket {
    /// The peer's host address, e.g. `"192.0.2.7"`. Used as the
    /// blacklist key.
    fn peer_address(&self) -> String;

    /// The peer's full endpoint for logging, e.g. `"192.0.2.7::58741"`.
    fn peer_endpoint(&self) -> String;

    /// True if connections on this socket always need out-of-band
    /// approval regardless of the query-connect setting.
    fn requires_query(&self) -> bool {
        false
    }

    /// Attempts a non-blocking write; may write fewer bytes than given.
    fn try_write(&self, data: &[u8]) -> io::Result<usize>;

    /// Requests shutdown. The socket stays alive (and pollable) until
    /// the embedder observes the closure and reaps it.
    fn shutdown(&self);
}

/// Shared handle to a socket.
pub type SocketRef = Rc<dyn Socket>;

/// True if the two handles refer to the same socket.
#[must_use]
pub fn same_socket(a: &SocketRef, b: &SocketRef) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSocket;

    impl Socket for FakeSocket {
        fn peer_address(&self) -> String {
            "10.0.0.1".into()
        }
        fn peer_endpoint(&self) -> String {
            "10.0.0.1::5900".into()
        }
        fn try_write(&self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn shutdown(&self) {}
    }

    #[test]
    fn test_identity_is_by_handle() {
        let a: SocketRef = Rc::new(FakeSocket);
        let b: SocketRef = Rc::new(FakeSocket);
        let a2 = Rc::clone(&a);
        assert!(same_socket(&a, &a2));
        assert!(!same_socket(&a, &b));
    }
}
