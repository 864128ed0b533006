use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::ids::ChannelId;

/// Cómo se llega a un worker: dirección detectada, puerto RPC y puerto
/// de datos. Se calcula una sola vez al arrancar y es la identidad del
/// worker para el coordinador.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceConnectionInfo {
    pub address: IpAddr,
    pub rpc_port: u16,
    pub data_port: u16,
}

impl InstanceConnectionInfo {
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.rpc_port)
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.data_port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.rpc_addr())
    }
}

impl fmt::Display for InstanceConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.rpc_port, self.data_port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareDescription {
    pub cpu_cores: usize,
    /// Bytes.
    pub physical_memory: u64,
    /// Bytes que pueden usar los administradores de recursos.
    pub usable_memory: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub instance: InstanceConnectionInfo,
    pub hostname: String,
    pub hardware: HardwareDescription,
    pub running_tasks: u32,
    pub free_memory_pages: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub instance: InstanceConnectionInfo,
    pub hostname: String,
    pub dead: bool,
    pub last_heartbeat_secs_ago: u64,
    pub hardware: HardwareDescription,
    pub running_tasks: u32,
    pub free_memory_pages: usize,
    pub tasks_deployed: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelUtilization {
    pub channel_id: ChannelId,
    pub queued_buffers: usize,
    pub capacity: usize,
}

/// Foto de solo lectura del administrador de canales.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferUtilization {
    pub registered_tasks: usize,
    pub input_channels: Vec<ChannelUtilization>,
    pub output_channels: usize,
    pub cached_lookups: usize,
    pub records_sent: u64,
    pub records_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
