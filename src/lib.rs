/*!
# muxwire

muxwire is the transport layer of a peer-to-peer node. It runs many logical
protocols over a single TCP connection per peer.

* `networking::pool` owns the sockets. Each connection has a read task and a
  write task, and a single pump (`ConnectionPool::handle_messages`) turns
  buffered bytes into frames.
* `networking::dispatcher` maps the 4 byte message id at the front of every
  payload to a concrete message type, one registry per channel.
* `service` binds application handlers to channels, tracks which connections
  joined which service, and runs the channel 0 control protocol that joins
  them.

# Usage

```bash
cargo run -- --config=config --peer=127.0.0.1:6001
```

*/
pub mod config;
pub mod error;
pub mod networking;
pub mod node;
pub mod service;
pub mod time;

#[cfg(test)]
pub mod test_setup;
#[cfg(test)]
pub mod test_utilities;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
