//! Session start-up and the per-role runtimes.
//!
//! [`init`] decides the role of the calling rank from the placement, wires the
//! client and server channels over the fabric and returns the runtime the
//! rank drives from then on.

pub mod client;
pub mod server;

pub use client::{ClientReport, ClientRuntime};
pub use server::{ServerReport, ServerRuntime};

use std::time::Duration;

use bytes::Bytes;

use crate::config::IofwdConfig;
use crate::error::IofwdResult;
use crate::group::{ProcessGroup, TAG_ENDPOINT_ADDRESS};
use crate::placement::{Placement, ProcessRole};
use crate::protocol::max_message_size;
use crate::storage::StorageTarget;
use crate::transport::{ClientChannel, EndpointAddress, Fabric};

/// What the calling rank does for the rest of the session.
pub enum Role {
    Client(ClientRuntime),
    Server(ServerRuntime),
    /// Launched beyond the chosen server count; takes no part.
    Idle,
}

impl Role {
    pub fn kind(&self) -> ProcessRole {
        match self {
            Role::Client(_) => ProcessRole::Client,
            Role::Server(_) => ProcessRole::Server,
            Role::Idle => ProcessRole::Idle,
        }
    }
}

/// Sizes derived from the configuration and the placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSizing {
    pub client_buffer: usize,
    pub server_region: usize,
    pub max_message: usize,
    pub transfer_limit: usize,
}

impl ChannelSizing {
    pub fn new(config: &IofwdConfig, placement: &Placement) -> Self {
        let clients_per_server = placement.clients_per_server();
        let buffers = &config.buffers;
        let server_region = buffers.server_region_size(clients_per_server);
        Self {
            client_buffer: buffers.client_buffer_size,
            server_region,
            max_message: max_message_size(
                buffers.msg_buffer_size,
                server_region,
                buffers.client_buffer_size,
                buffers.send_msg_min_size,
                placement.client_amount(),
            ),
            transfer_limit: config.transport.transfer_limit(clients_per_server),
        }
    }
}

/// Join the session as `group.rank()`.
///
/// Servers announce their endpoint to each of their clients over `group`;
/// clients wait for that announcement and connect. A client's `init` only
/// returns once its server is running its loop.
pub fn init<G: ProcessGroup + ?Sized>(
    group: &G,
    fabric: &Fabric,
    config: &IofwdConfig,
    storage: &StorageTarget,
) -> IofwdResult<Role> {
    config.validate()?;
    let placement = Placement::new(
        config.placement.client_x,
        config.placement.client_y,
        config.placement.ratio,
        group.size(),
    )?;
    let rank = group.rank();
    let sizing = ChannelSizing::new(config, &placement);

    match placement.role(rank)? {
        ProcessRole::Server => {
            let endpoint = fabric.open_endpoint(rank)?;
            let clients = placement.clients_of_server(rank)?;
            let server = ServerRuntime::new(
                endpoint,
                &clients,
                sizing.server_region,
                storage.open()?,
                sizing.transfer_limit,
                Duration::from_millis(config.transport.poll_interval_ms),
            );

            let address = Bytes::from(server.address().to_bytes());
            for &client in &clients {
                group.send(client, TAG_ENDPOINT_ADDRESS, address.clone())?;
            }
            Ok(Role::Server(server))
        }
        ProcessRole::Client => {
            let endpoint = fabric.open_endpoint(rank)?;
            let server = placement.server_of_client(rank)?;
            let address = EndpointAddress::from_bytes(&group.recv(server, TAG_ENDPOINT_ADDRESS)?)?;
            let (channel, ring) = ClientChannel::connect(endpoint, &address, sizing.client_buffer)?;
            tracing::debug!(rank, server, max_message = sizing.max_message, "client connected");
            Ok(Role::Client(ClientRuntime::new(
                rank,
                channel,
                ring,
                sizing.max_message,
            )))
        }
        ProcessRole::Idle => {
            tracing::info!(rank, "no role in this session");
            Ok(Role::Idle)
        }
    }
}
