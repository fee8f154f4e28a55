/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

extern crate argh;
extern crate schist_mqtt;
extern crate simplelog;
extern crate tokio;
extern crate url;

use argh::FromArgs;
use schist_mqtt::client::*;
use schist_mqtt::config::*;
use schist_mqtt::error::SchistError;
use schist_mqtt::features::schist_tokio::*;
use schist_mqtt::mqtt::*;
use simplelog::*;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use url::Url;

#[derive(FromArgs, Debug, PartialEq)]
/// schist-console - an interactive MQTT 3.1.1 console
struct CommandLineArgs {

    /// URI of endpoint to connect to.  Only the `mqtt` scheme is supported.
    #[argh(positional)]
    endpoint_uri: String,

    /// client id to connect with.  A random one is generated if not set.
    #[argh(option)]
    client_id: Option<String>,

    /// username to connect with
    #[argh(option)]
    username: Option<String>,

    /// password to connect with; ignored without a username
    #[argh(option)]
    password: Option<String>,

    /// keep alive interval in seconds; 0 disables keep alive
    #[argh(option, default = "60")]
    keep_alive: u16,

    /// start every connect with a clean session
    #[argh(switch)]
    clean_start: bool,

    /// topic of a last will the broker publishes if the connection drops without a DISCONNECT
    #[argh(option)]
    will_topic: Option<String>,

    /// last will payload; requires --will-topic
    #[argh(option)]
    will_payload: Option<String>,

    /// last will quality of service (0, 1, 2)
    #[argh(option, default = "0")]
    will_qos: u8,

    /// ask the broker to retain the last will
    #[argh(switch)]
    will_retain: bool,

    /// path to a log file that should be written
    #[argh(option)]
    logpath: Option<PathBuf>,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "connect")]
/// connects the client
struct ConnectArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "disconnect")]
/// disconnects the client; by default a DISCONNECT packet is sent first
struct DisconnectArgs {

    /// close the connection without sending DISCONNECT, which triggers the last will
    #[argh(switch)]
    abrupt: bool,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "quit")]
/// causes the program to quit
struct QuitArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "close")]
/// closes the client, dropping any connection and rendering it unusable
struct CloseArgs {
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "subscribe")]
/// Subscribe client command
struct SubscribeArgs {

    /// topic filter to subscribe to
    #[argh(positional)]
    topic_filter: String,

    /// subscription quality of service (0, 1, 2)
    #[argh(positional)]
    qos: u8,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "unsubscribe")]
/// Unsubscribe client command
struct UnsubscribeArgs {

    /// topic filter to unsubscribe from
    #[argh(positional)]
    topic_filter: String,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "publish")]
/// Publish client command
struct PublishArgs {

    /// topic to publish a message to
    #[argh(positional)]
    topic: String,

    /// quality of service (0, 1, 2)
    #[argh(positional)]
    qos: u8,

    /// message payload
    #[argh(positional)]
    payload: Option<String>,

    /// ask the broker to retain the message
    #[argh(switch)]
    retain: bool,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand)]
enum SubCommandEnum {
    Connect(ConnectArgs),
    Disconnect(DisconnectArgs),
    Quit(QuitArgs),
    Close(CloseArgs),
    Publish(PublishArgs),
    Subscribe(SubscribeArgs),
    Unsubscribe(UnsubscribeArgs),
}

#[derive(FromArgs, Debug, PartialEq)]
/// schist-console - an interactive MQTT 3.1.1 console
struct CommandArgs {
    #[argh(subcommand)]
    nested: SubCommandEnum,
}

#[derive(Debug)]
enum ConsoleError {
    ClientError(SchistError),
    InvalidUri(String),
    UnsupportedUriScheme(String),
    MissingWillTopic,
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::ClientError(inner) => {
                write!(f, "client error - {}", inner)
            }
            ConsoleError::InvalidUri(uri) => {
                write!(f, "invalid uri - `{}`", uri)
            }
            ConsoleError::UnsupportedUriScheme(scheme) => {
                write!(f, "invalid uri scheme - `{}`", scheme)
            }
            ConsoleError::MissingWillTopic => {
                write!(f, "last will options require --will-topic")
            }
        }
    }
}

impl std::error::Error for ConsoleError {

}

impl From<SchistError> for ConsoleError {
    fn from(value: SchistError) -> Self {
        ConsoleError::ClientError(value)
    }
}

struct ConsoleCallbacks {}

impl ClientCallbacks for ConsoleCallbacks {
    fn on_message(&self, message: &IncomingMessage) {
        println!("Message Received!");
        println!("{}\n", message);
    }

    fn on_connection_state_changed(&self, state: ConnectionState, error: Option<&SchistError>) {
        match error {
            Some(error) => { println!("Connection State: {} ( {} )\n", state, error); }
            None => { println!("Connection State: {}\n", state); }
        }
    }
}

fn build_connection_config(args: &CommandLineArgs) -> Result<ConnectionConfig, ConsoleError> {
    let uri = Url::parse(&args.endpoint_uri).map_err(|_| ConsoleError::InvalidUri(args.endpoint_uri.clone()))?;
    if uri.scheme().to_lowercase() != "mqtt" {
        return Err(ConsoleError::UnsupportedUriScheme(uri.scheme().to_string()));
    }

    let mut builder = ConnectionConfigBuilder::new_from_uri(&args.endpoint_uri)?;
    builder
        .with_keep_alive_seconds(args.keep_alive)
        .with_clean_start(args.clean_start);

    if let Some(client_id) = &args.client_id {
        builder.with_client_id(client_id);
    }

    if let Some(username) = &args.username {
        builder.with_credentials(Credentials::new(username, args.password.as_ref().map(|password| password.as_bytes())));
    }

    if let Some(last_will) = build_last_will(args)? {
        builder.with_last_will(last_will);
    }

    let config = builder.build();
    config.validate()?;

    Ok(config)
}

fn build_last_will(args: &CommandLineArgs) -> Result<Option<LastWill>, ConsoleError> {
    let topic =
        match &args.will_topic {
            Some(topic) => { topic }
            None => {
                if args.will_payload.is_some() || args.will_qos != 0 || args.will_retain {
                    return Err(ConsoleError::MissingWillTopic);
                }

                return Ok(None);
            }
        };

    let qos = QualityOfService::try_from(args.will_qos)?;
    let payload = args.will_payload.as_ref().map(|payload| payload.as_bytes().to_vec()).unwrap_or_default();

    Ok(Some(LastWill::new(topic, payload, qos, args.will_retain)))
}

fn handle_connect(client: &MqttClient, config: &ConnectionConfig, _: ConnectArgs) {
    let connect_future = client.connect(config.clone());

    tokio::spawn(async move {
        match connect_future.await {
            Ok(connack) => {
                println!("Connect Result: Ok( {} )\n", connack);
            }
            Err(err) => {
                println!("Connect Result: Err( {} )\n", err);
            }
        }
    });
}

fn handle_disconnect(client: &MqttClient, args: DisconnectArgs) {
    if let Err(err) = client.disconnect(!args.abrupt) {
        println!("Disconnect Result: Err( {} )\n", err);
    }
}

fn handle_close(client: &MqttClient, _ : CloseArgs) {
    let _ = client.close();
}

fn handle_publish(client: &MqttClient, args: PublishArgs) {
    let qos =
        match QualityOfService::try_from(args.qos) {
            Ok(qos) => { qos }
            Err(_) => {
                println!("Invalid input!  Qos must be 0, 1, or 2");
                return;
            }
        };

    let payload = args.payload.map(|payload| payload.into_bytes()).unwrap_or_default();
    let publish_future = client.publish(&args.topic, payload, qos, args.retain);

    tokio::spawn(async move {
        match publish_future.await {
            Ok(publish_response) => {
                println!("Publish Result: Ok( {} )\n", publish_response);
            }
            Err(err) => {
                println!("Publish Result: Err( {} )\n", err);
            }
        }
    });
}

fn handle_subscribe(client: &MqttClient, args: SubscribeArgs) {
    let qos =
        match QualityOfService::try_from(args.qos) {
            Ok(qos) => { qos }
            Err(_) => {
                println!("Invalid input!  Qos must be 0, 1, or 2");
                return;
            }
        };

    let subscribe_future = client.subscribe(&args.topic_filter, qos);

    tokio::spawn(async move {
        match subscribe_future.await {
            Ok(suback) => {
                println!("Subscribe Result: Ok( {} )\n", suback);
            }
            Err(err) => {
                println!("Subscribe Result: Err( {} )\n", err);
            }
        }
    });
}

fn handle_unsubscribe(client: &MqttClient, args: UnsubscribeArgs) {
    let unsubscribe_future = client.unsubscribe(&args.topic_filter);

    tokio::spawn(async move {
        match unsubscribe_future.await {
            Ok(unsuback) => {
                println!("Unsubscribe Result: Ok( {} )\n", unsuback);
            }
            Err(err) => {
                println!("Unsubscribe Result: Err( {} )\n", err);
            }
        }
    });
}

fn handle_input(value: String, client: &MqttClient, config: &ConnectionConfig) -> bool {
    let args : Vec<&str> = value.split_whitespace().collect();
    if args.is_empty() {
        println!("Invalid input!");
        return false;
    }

    let parsed_result = CommandArgs::from_args(&[], &args[0..]);
    let command =
        match parsed_result {
            Ok(command) => { command }
            Err(err) => {
                println!("{}", err.output);
                return false;
            }
        };

    match command.nested {
        SubCommandEnum::Connect(args) => { handle_connect(client, config, args) }
        SubCommandEnum::Disconnect(args) => { handle_disconnect(client, args) }
        SubCommandEnum::Close(args) => { handle_close(client, args) }
        SubCommandEnum::Quit(_) => { return true; }
        SubCommandEnum::Publish(args) => { handle_publish(client, args) }
        SubCommandEnum::Subscribe(args) => { handle_subscribe(client, args) }
        SubCommandEnum::Unsubscribe(args) => { handle_unsubscribe(client, args) }
    }

    false
}

async fn main_loop(client: MqttClient, config: ConnectionConfig) {

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if handle_input(line, &client, &config) {
            break;
        }
    }

    let _ = client.close();

    println!("Done");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli_args: CommandLineArgs = argh::from_env();

    if let Some(log_file_path) = &cli_args.logpath {
        let log_file_result = File::create(log_file_path);
        if log_file_result.is_err() {
            println!("Could not create log file");
            return Ok(());
        }

        let mut log_config_builder = simplelog::ConfigBuilder::new();
        let log_config = log_config_builder.build();
        WriteLogger::init(LevelFilter::Debug, log_config, log_file_result?)?;
    }

    let config = build_connection_config(&cli_args)?;

    let client_options = ClientOptionsBuilder::new()
        .with_callbacks(Arc::new(ConsoleCallbacks{}))
        .build();

    let client = MqttClient::new_with_tokio(client_options, TokioClientOptions::new_tcp(), &Handle::current());

    println!("schist-console - an interactive MQTT 3.1.1 console application\n");
    println!(" `help` for command assistance\n");

    main_loop(client, config).await;

    Ok(())
}
