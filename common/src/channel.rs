use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ChannelId;
use crate::worker::InstanceConnectionInfo;

/// Tipo genérico de registro que viaja por los canales.
/// Usamos JSON para poder representar cualquier fila.
pub type Record = Value;

/// Respuesta del coordinador al preguntar dónde vive el consumidor
/// de un canal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "instance", rename_all = "snake_case")]
pub enum ChannelLookup {
    Found(InstanceConnectionInfo),
    /// El consumidor todavía no se desplegó; reintentar más tarde.
    Pending,
    /// El canal no pertenece a ningún job conocido.
    Unknown,
}

/// Frame del plano de datos: una línea JSON por frame sobre TCP.
///
/// ```text
/// {"frame":"open","channel":"..."}
/// {"frame":"batch","records":[...]}
/// {"frame":"end"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum DataFrame {
    Open { channel: ChannelId },
    Batch { records: Vec<Record> },
    End,
}

impl DataFrame {
    /// Serializa el frame como una línea terminada en `\n`.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }
}

/// Respuesta del servidor de datos al frame `open`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAck {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}
