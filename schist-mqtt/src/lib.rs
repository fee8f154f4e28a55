/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
schist-mqtt is an asynchronous MQTT 3.1.1 client protocol engine.

The crate is split into a sans-IO protocol core (packet codec, connection state machine, QoS
delivery tracking, keep-alive and session state) and a [`tokio`](https://crates.io/crates/tokio)
runtime adapter that owns the transport and drives the core from a single task.

# Example

```no_run
use schist_mqtt::client::*;
use schist_mqtt::config::*;
use schist_mqtt::mqtt::QualityOfService;
use schist_mqtt::features::schist_tokio::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = MqttClient::new_with_tokio(
        ClientOptionsBuilder::new().build(),
        TokioClientOptions::new_tcp(),
        &tokio::runtime::Handle::current());

    let config = ConnectionConfigBuilder::new_from_uri("mqtt://localhost:1883")?.build();
    client.connect(config).await?;

    client.subscribe("hello/+", QualityOfService::AtLeastOnce).await?;
    client.publish("hello/world", b"hi".to_vec(), QualityOfService::AtLeastOnce, false).await?;

    client.disconnect(true)?;
    Ok(())
}
```
 */

pub mod client;
pub mod config;
mod decode;
mod encode;
pub mod error;
pub mod features;
mod keep_alive;
mod logging;
pub mod mqtt;
mod backoff;
mod protocol;
pub mod session;
mod validate;

#[cfg(test)]
mod testing;

pub use backoff::compute_reconnect_delay;
pub use error::{SchistError, SchistResult};
pub use mqtt::QualityOfService;
