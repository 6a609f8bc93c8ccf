/*!

# Networking Interfaces and Methods

## Introduction

Nodes talk to each other over plain TCP. A single socket carries many logical
protocols at once, each on its own numbered channel, so independent
subsystems can share one connection per peer.

## Frames

Every unit on the wire is a frame:

```bytes
0-3     Payload length(big-endian u32)
4-5     Channel(big-endian u16)
6..     Payload
```

There is no checksum, integrity is left to the stream transport. A declared
length below the size of a message id or above the configured
`max_message_length` gets the peer disconnected with `InvalidMessageLength`.

## Payload

```bytes
0-3     MessageID(4 ASCII letters/digits, zero padded on the right)
4..     MessageData(bincode, big-endian, fixed-width integers)
```

The MessageID picks the concrete type the channel's `Dispatcher` decodes the
MessageData into. Ids are unique per dispatcher, so two channels can reuse the
same id for different types.

## Processing model

The `ConnectionPool` owns every connection. Each connection runs a read task
and a write task; neither touches the pool's tables. Read tasks post raw bytes
and disconnect requests through queues, and the pool's pump
(`handle_messages`) is the one place that buffers bytes, extracts frames,
calls handlers and tears connections down. Drive it from exactly one task.

*/

pub mod connection;
pub mod dispatcher;
pub mod frame;
pub mod message;
pub mod pool;
