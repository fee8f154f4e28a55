/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Functionality for using [`tokio`](https://crates.io/crates/tokio) as an MQTT client's async
runtime implementation.
 */

use crate::client::*;
use crate::client::shared_impl::*;
use crate::config::*;
use crate::error::{SchistError, SchistResult};
use crate::protocol::ProtocolStateType;
use log::*;
use std::future::Future;
use std::pin::Pin;
use std::time::{Instant, Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;

pub(crate) struct ClientRuntimeState<T> where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    tokio_config: TokioClientOptions<T>,
    operation_receiver: tokio::sync::mpsc::UnboundedReceiver<OperationOptions>,
    stream: Option<T>
}

impl<T> ClientRuntimeState<T> where T : AsyncRead + AsyncWrite + Send + Sync + 'static {

    // A closed operation channel means every client handle was dropped
    fn handle_operation_result(client: &mut MqttClientImpl, operation_result: Option<OperationOptions>) {
        let operation_options = operation_result.unwrap_or_else(|| {
            info!("tokio - all client handles dropped, closing");
            OperationOptions::Close()
        });

        client.handle_incoming_operation(operation_options, Instant::now());
    }

    pub(crate) async fn process_stopped(&mut self, client: &mut MqttClientImpl) -> SchistResult<ClientImplState> {
        loop {
            trace!("tokio - process_stopped loop");

            let operation_result = self.operation_receiver.recv().await;
            debug!("tokio - process_stopped - user operation received");
            Self::handle_operation_result(client, operation_result);

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }

    pub(crate) async fn process_connecting(&mut self, client: &mut MqttClientImpl) -> SchistResult<ClientImplState> {
        let endpoint =
            match client.endpoint() {
                Some(endpoint) => { endpoint }
                None => {
                    client.apply_error(SchistError::new_internal_state_error("connection attempt without an endpoint"));
                    return Ok(ClientImplState::PendingReconnect);
                }
            };

        info!("tokio - process_connecting - opening transport to {}", endpoint);
        let mut connect = (self.tokio_config.connection_factory)(endpoint);

        let timeout = sleep(client.connect_timeout());
        tokio::pin!(timeout);

        loop {
            trace!("tokio - process_connecting loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    debug!("tokio - process_connecting - user operation received");
                    Self::handle_operation_result(client, operation_result);
                }
                () = &mut timeout => {
                    info!("tokio - process_connecting - connection establishment timeout exceeded");
                    client.apply_error(SchistError::new_connection_establishment_failure("connection establishment timeout reached"));
                    return Ok(ClientImplState::PendingReconnect);
                }
                connection_result = &mut connect => {
                    match connection_result {
                        Ok(stream) => {
                            info!("tokio - process_connecting - transport connection established successfully");
                            self.stream = Some(stream);
                            return Ok(ClientImplState::Connected);
                        }
                        Err(error) => {
                            info!("tokio - process_connecting - transport connection establishment failed");
                            client.apply_error(SchistError::new_connection_establishment_failure(error));
                            return Ok(ClientImplState::PendingReconnect);
                        }
                    }
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }

    pub(crate) async fn process_connected(&mut self, client: &mut MqttClientImpl) -> SchistResult<ClientImplState> {
        let mut outbound_data: Vec<u8> = Vec::with_capacity(4096);
        let mut cumulative_bytes_written : usize = 0;

        let mut inbound_data: [u8; 4096] = [0; 4096];

        let stream =
            match self.stream.take() {
                Some(stream) => { stream }
                None => {
                    client.apply_error(SchistError::new_internal_state_error("connected without a transport stream"));
                    return Ok(ClientImplState::PendingReconnect);
                }
            };

        let (stream_reader, mut stream_writer) = split(stream);
        tokio::pin!(stream_reader);

        let mut should_flush = false;
        let mut write_directive : Option<WriteDirective>;

        let next_state = loop {
            trace!("tokio - process_connected loop");

            let mut next_state = None;
            let now = Instant::now();
            let next_service_time_option = client.get_next_connected_service_time(now);
            let service_wait: Option<tokio::time::Sleep> = next_service_time_option.map(|next_service_time| sleep(next_service_time.saturating_duration_since(now)));

            let outbound_slice_option: Option<&[u8]> =
                if cumulative_bytes_written < outbound_data.len() {
                    Some(&outbound_data[cumulative_bytes_written..])
                } else {
                    None
                };

            if should_flush {
                debug!("tokio - process_connected - flushing previous write");
                write_directive = Some(WriteDirective::Flush);
            } else if let Some(outbound_slice) = outbound_slice_option {
                debug!("tokio - process_connected - {} bytes to write", outbound_slice.len());
                write_directive = Some(WriteDirective::Bytes(outbound_slice))
            } else {
                debug!("tokio - process_connected - nothing to write");
                write_directive = None;
            }

            tokio::select! {
                // incoming user operations future
                operation_result = self.operation_receiver.recv() => {
                    debug!("tokio - process_connected - user operation received");
                    Self::handle_operation_result(client, operation_result);
                }
                // incoming data on the socket future
                read_result = stream_reader.read(inbound_data.as_mut_slice()) => {
                    match read_result {
                        Ok(bytes_read) => {
                            debug!("tokio - process_connected - read {} bytes from connection stream", bytes_read);

                            if bytes_read == 0 {
                                info!("tokio - process_connected - connection closed for read (0 bytes)");
                                let error = connection_error(client, "network stream closed");
                                client.apply_error(error);
                                next_state = Some(ClientImplState::PendingReconnect);
                            } else if let Err(error) = client.handle_incoming_bytes(&inbound_data[..bytes_read], Instant::now()) {
                                info!("tokio - process_connected - error handling incoming bytes: {:?}", error);
                                client.apply_error(error);
                                next_state = Some(ClientImplState::PendingReconnect);
                            }
                        }
                        Err(error) => {
                            info!("tokio - process_connected - connection stream read failed: {:?}", error);
                            let error = connection_error(client, error);
                            client.apply_error(error);
                            next_state = Some(ClientImplState::PendingReconnect);
                        }
                    }
                }
                // client service future (if relevant)
                Some(_) = conditional_wait(service_wait) => {
                    debug!("tokio - process_connected - running client service task");
                    if let Err(error) = client.handle_service(&mut outbound_data, Instant::now()) {
                        client.apply_error(error);
                        next_state = Some(ClientImplState::PendingReconnect);
                    }
                }
                // outbound data future (if relevant)
                Some(bytes_written_result) = conditional_write(write_directive, &mut stream_writer) => {
                    match bytes_written_result {
                        Ok(bytes_written) => {
                            debug!("tokio - process_connected - wrote {} bytes to connection stream", bytes_written);
                            if should_flush {
                                should_flush = false;
                                if let Err(error) = client.handle_write_completion(Instant::now()) {
                                    info!("tokio - process_connected - stream write completion handler failed: {:?}", error);
                                    client.apply_error(error);
                                    next_state = Some(ClientImplState::PendingReconnect);
                                }
                            } else {
                                cumulative_bytes_written += bytes_written;
                                if cumulative_bytes_written == outbound_data.len() {
                                    outbound_data.clear();
                                    cumulative_bytes_written = 0;
                                    should_flush = true;
                                }
                            }
                        }
                        Err(error) => {
                            info!("tokio - process_connected - connection stream write failed: {:?}", error);
                            let error = connection_error(client, error);
                            client.apply_error(error);
                            next_state = Some(ClientImplState::PendingReconnect);
                        }
                    }
                }
            }

            if let Some(state) = next_state.or_else(|| client.compute_optional_state_transition()) {
                break state;
            }
        };

        info!("tokio - process_connected - shutting down stream");
        let _ = stream_writer.shutdown().await;
        info!("tokio - process_connected - stream fully closed");

        Ok(next_state)
    }

    pub(crate) async fn process_pending_reconnect(&mut self, client: &mut MqttClientImpl, wait: Duration) -> SchistResult<ClientImplState> {
        info!("tokio - process_pending_reconnect - waiting {:?} before reconnecting", wait);
        let reconnect_timer = sleep(wait);
        tokio::pin!(reconnect_timer);

        loop {
            trace!("tokio - process_pending_reconnect loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    debug!("tokio - process_pending_reconnect - user operation received");
                    Self::handle_operation_result(client, operation_result);
                }
                () = &mut reconnect_timer => {
                    info!("tokio - process_pending_reconnect - reconnect timer exceeded");
                    return Ok(ClientImplState::Connecting);
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }
}

// I/O failures before the CONNACK count against the connection attempt
fn connection_error(client: &MqttClientImpl, source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> SchistError {
    if client.get_protocol_state() == ProtocolStateType::Connected {
        SchistError::new_connection_lost(source)
    } else {
        SchistError::new_connection_establishment_failure(source)
    }
}

async fn conditional_wait(wait_option: Option<tokio::time::Sleep>) -> Option<()> {
    match wait_option {
        Some(timer) => {
            timer.await;
            Some(())
        },
        None => None,
    }
}

enum WriteDirective<'a> {
    Bytes(&'a[u8]),
    Flush
}

async fn conditional_write<'a, T>(directive: Option<WriteDirective<'a>>, writer: &mut WriteHalf<T>) -> Option<std::io::Result<usize>> where T : AsyncRead + AsyncWrite {
    match directive {
        Some(WriteDirective::Bytes(bytes)) => {
            Some(writer.write(bytes).await)
        }
        Some(WriteDirective::Flush) => {
            if let Err(error) = writer.flush().await {
                Some(Err(error))
            } else {
                Some(Ok(0))
            }
        }
        _ => { None }
    }
}

async fn client_event_loop<T>(client_impl: &mut MqttClientImpl, async_state: &mut ClientRuntimeState<T>) where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    let mut done = false;
    while !done {
        let current_state = client_impl.get_current_state();
        let next_state_result =
            match current_state {
                ClientImplState::Stopped => { async_state.process_stopped(client_impl).await }
                ClientImplState::Connecting => { async_state.process_connecting(client_impl).await }
                ClientImplState::Connected => { async_state.process_connected(client_impl).await }
                ClientImplState::PendingReconnect => {
                    let reconnect_wait = client_impl.compute_reconnect_period();
                    async_state.process_pending_reconnect(client_impl, reconnect_wait).await
                }
                _ => { Ok(ClientImplState::Shutdown) }
            };

        done = true;
        if let Ok(next_state) = next_state_result {
            if client_impl.transition_to_state(next_state, Instant::now()).is_ok() && (next_state != ClientImplState::Shutdown) {
                done = false;
            }
        }
    }

    info!("Async client loop exiting");
}

pub(crate) fn create_runtime_states<T>(tokio_config: TokioClientOptions<T>) -> (UnboundedSender<OperationOptions>, ClientRuntimeState<T>) where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();

    let impl_state = ClientRuntimeState {
        tokio_config,
        operation_receiver: receiver,
        stream: None
    };

    (sender, impl_state)
}

pub(crate) fn spawn_client_impl<T>(
    mut client_impl: MqttClientImpl,
    mut runtime_state: ClientRuntimeState<T>,
    runtime_handle: &runtime::Handle,
) where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    runtime_handle.spawn(async move {
        client_event_loop(&mut client_impl, &mut runtime_state).await;
    });
}

/// Return type of a tokio connection factory
pub type TokioConnectionFactoryReturnType<T> = Pin<Box<dyn Future<Output = SchistResult<T>> + Send>>;

/// Tokio-specific client configuration
pub struct TokioClientOptions<T> where T : AsyncRead + AsyncWrite + Send + Sync {

    /// Factory function for creating the transport to an endpoint.  It might be a TcpStream, a
    /// TLS stream, a websocket byte stream, or an in-memory duplex in tests.
    ///
    /// Ultimately, the type must implement AsyncRead and AsyncWrite.
    pub connection_factory: Box<dyn Fn(Endpoint) -> TokioConnectionFactoryReturnType<T> + Send + Sync>,
}

impl<T> TokioClientOptions<T> where T : AsyncRead + AsyncWrite + Send + Sync {

    /// Creates tokio options from a caller-supplied transport factory
    pub fn new(connection_factory: Box<dyn Fn(Endpoint) -> TokioConnectionFactoryReturnType<T> + Send + Sync>) -> Self {
        TokioClientOptions {
            connection_factory
        }
    }
}

impl TokioClientOptions<TcpStream> {

    /// Creates tokio options that open plain TCP connections.  Only `mqtt://` endpoints are
    /// supported; other schemes fail the connection attempt with a `TransportError`.
    pub fn new_tcp() -> Self {
        TokioClientOptions {
            connection_factory: Box::new(|endpoint| -> TokioConnectionFactoryReturnType<TcpStream> {
                Box::pin(make_tcp_stream(endpoint))
            })
        }
    }
}

async fn make_tcp_stream(endpoint: Endpoint) -> SchistResult<TcpStream> {
    if endpoint.scheme() != EndpointScheme::Mqtt {
        error!("make_tcp_stream - {} endpoints require a caller-supplied transport", endpoint.scheme());
        return Err(SchistError::new_transport_error(format!("unsupported endpoint scheme for tcp transport: {}", endpoint.scheme())));
    }

    debug!("make_tcp_stream - opening TCP stream to {}:{}", endpoint.host(), endpoint.port());
    let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
    debug!("make_tcp_stream - TCP stream successfully established");

    Ok(stream)
}

impl MqttClient {

    /// Creates a new async MQTT client that will use the tokio async runtime.  The client starts
    /// disconnected; call [`MqttClient::connect`] to begin.
    pub fn new_with_tokio<T>(client_options: ClientOptions, tokio_config: TokioClientOptions<T>, runtime_handle: &runtime::Handle) -> MqttClient where T: AsyncRead + AsyncWrite + Send + Sync + 'static {
        let (operation_sender, internal_state) = create_runtime_states(tokio_config);

        let client_impl = MqttClientImpl::new(client_options, Instant::now());

        spawn_client_impl(client_impl, internal_state, runtime_handle);

        MqttClient {
            operation_sender,
        }
    }
}
