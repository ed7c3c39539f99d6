//! Protocol Layer: line-oriented echo protocol
//!
//! - Welcome banner sent once per connection
//! - Framing: newline-delimited lines (default) or one message per read
//! - A frame equal to the terminator token ends the session

mod framing;

use std::net::SocketAddr;

pub use framing::{strip_line_ending, FrameError, FrameReader, Framing};

/// Default terminator token.
pub const DEFAULT_TERMINATOR: &str = "QUIT";

/// Welcome banner for a peer at `peer`.
pub fn welcome_message(peer: SocketAddr, terminator: &str) -> String {
    format!(
        "Hi! I'm an echo server. You are {} talking on port {}.\n\
         I will send you back whatever you send me. I will stop if you send me {} :-)\n",
        peer.ip(),
        peer.port(),
        terminator
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_message_names_peer() {
        let peer: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        assert_eq!(
            welcome_message(peer, "QUIT"),
            "Hi! I'm an echo server. You are 127.0.0.1 talking on port 40123.\n\
             I will send you back whatever you send me. I will stop if you send me QUIT :-)\n"
        );
    }
}
