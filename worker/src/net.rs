//! Detección de la dirección propia del worker.
//!
//! Se prueba cada dirección de cada interfaz con estrategias cada vez más
//! permisivas hasta encontrar una desde la que se llegue al coordinador.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpSocket;
use tracing::{debug, info};

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Sólo direcciones que comparten los dos primeros bytes con el
    /// coordinador (ej: 192.168.x.x).
    PrefixMatch,
    /// Todas las direcciones, timeout corto.
    FastConnect,
    /// Todas las direcciones, timeout largo.
    SlowConnect,
}

impl Strategy {
    pub fn timeout(self) -> Duration {
        match self {
            Strategy::PrefixMatch | Strategy::FastConnect => Duration::from_millis(50),
            Strategy::SlowConnect => Duration::from_millis(1000),
        }
    }

    fn next(self) -> Option<Strategy> {
        match self {
            Strategy::PrefixMatch => Some(Strategy::FastConnect),
            Strategy::FastConnect => Some(Strategy::SlowConnect),
            Strategy::SlowConnect => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Fuente de interfaces de red; en tests se reemplaza por una lista fija.
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>>;
}

/// Interfaces reales del sistema (`if-addrs`), agrupadas por nombre.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
        let mut by_name: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
        for iface in if_addrs::get_if_addrs()? {
            let ip = iface.ip();
            by_name.entry(iface.name).or_default().push(ip);
        }
        Ok(by_name
            .into_iter()
            .map(|(name, addresses)| NetInterface { name, addresses })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
    pub address: IpAddr,
    pub strategy: Strategy,
}

pub struct AddressDetector<S = SystemInterfaces> {
    source: S,
}

impl AddressDetector<SystemInterfaces> {
    pub fn system() -> Self {
        Self {
            source: SystemInterfaces,
        }
    }
}

impl<S: InterfaceSource> AddressDetector<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Recorre todas las interfaces con cada estrategia antes de pasar
    /// a la siguiente. Agotar `SlowConnect` es fatal.
    pub async fn detect(&self, coordinator: SocketAddr) -> Result<Detected, WorkerError> {
        let mut strategy = Strategy::PrefixMatch;

        loop {
            let interfaces = self.source.interfaces()?;

            for iface in &interfaces {
                for &candidate in &iface.addresses {
                    if candidate.is_ipv4() != coordinator.is_ipv4() {
                        continue;
                    }
                    if strategy == Strategy::PrefixMatch
                        && !has_common_prefix(candidate, coordinator.ip())
                    {
                        continue;
                    }
                    if try_to_connect(candidate, coordinator, strategy.timeout()).await {
                        info!(
                            "dirección propia {} (interfaz {}, estrategia {:?})",
                            candidate, iface.name, strategy
                        );
                        return Ok(Detected {
                            address: candidate,
                            strategy,
                        });
                    }
                }
            }

            match strategy.next() {
                Some(next) => {
                    debug!("pasando a estrategia de detección {:?}", next);
                    strategy = next;
                }
                None => return Err(WorkerError::AddressDetection { coordinator }),
            }
        }
    }
}

/// Primeros dos bytes iguales.
fn has_common_prefix(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..2] == b.octets()[..2],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets()[..2] == b.octets()[..2],
        _ => false,
    }
}

/// Abre un socket ligado a `from:0` y conecta a `to` con timeout.
/// El socket se cierra siempre al salir.
pub async fn try_to_connect(from: IpAddr, to: SocketAddr, timeout: Duration) -> bool {
    debug!("probando conectar a {} desde {} (timeout {:?})", to, from, timeout);

    let created = if from.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    };
    let socket = match created {
        Ok(s) => s,
        Err(e) => {
            debug!("no se pudo crear el socket: {}", e);
            return false;
        }
    };

    if let Err(e) = socket.bind(SocketAddr::new(from, 0)) {
        debug!("falló bind en {}: {}", from, e);
        return false;
    }

    match tokio::time::timeout(timeout, socket.connect(to)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!("falló en esta dirección: {}", e);
            false
        }
        Err(_) => {
            debug!("timeout en esta dirección");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    struct Fixed(Vec<NetInterface>);

    impl InterfaceSource for Fixed {
        fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
            Ok(self.0.clone())
        }
    }

    fn iface(name: &str, addrs: &[&str]) -> NetInterface {
        NetInterface {
            name: name.to_string(),
            addresses: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn prefix_is_first_two_bytes() {
        let a: IpAddr = "192.168.1.10".parse().unwrap();
        assert!(has_common_prefix(a, "192.168.77.1".parse().unwrap()));
        assert!(!has_common_prefix(a, "192.169.1.10".parse().unwrap()));
        assert!(!has_common_prefix(a, "::1".parse().unwrap()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prefix_match_is_found_without_escalation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let coordinator = listener.local_addr().unwrap();

        // 203.0.113.x no es local: bind falla y se salta
        let detector = AddressDetector::new(Fixed(vec![
            iface("eth0", &["203.0.113.7", "fe80::1"]),
            iface("lo", &["127.0.0.1"]),
        ]));

        let detected = detector.detect(coordinator).await.unwrap();
        assert_eq!(detected.address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(detected.strategy, Strategy::PrefixMatch);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausting_every_strategy_is_fatal() {
        // puerto que se libera enseguida: nadie escucha
        let coordinator = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let detector = AddressDetector::new(Fixed(vec![iface("lo", &["127.0.0.1"])]));

        let started = Instant::now();
        let err = detector.detect(coordinator).await.unwrap_err();
        assert!(matches!(err, WorkerError::AddressDetection { .. }));
        // conexión rechazada: no hace falta esperar los timeouts
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_interfaces_is_fatal() {
        let detector = AddressDetector::new(Fixed(Vec::new()));
        let err = detector
            .detect("127.0.0.1:9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AddressDetection { .. }));
    }
}
