/*!
# muxwire node

## Help

```bash
muxwire --help
```

## Example Usage

```bash
muxwire --config=config --peer=127.0.0.1:6001 --peer=127.0.0.1:6002
```

The settings file is optional. Its `[network]` table sets the listen address,
limits, timeouts and queue sizes; anything left out keeps its default.
*/

use muxwire::node;

#[tokio::main]
pub async fn main() -> muxwire::Result<()> {
    tracing_subscriber::fmt::init();
    node::run().await
}
