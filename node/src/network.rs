use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Station-mode link events, as raised by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Started,
    Disconnected,
    GotIp(IpAddr),
}

/// Network interface that can be told to (re)connect. Progress is
/// reported back as [`LinkEvent`]s, not through the return value.
pub trait Station: Send {
    fn connect(&mut self) -> Result<(), NetworkError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkStats {
    pub connect_attempts: usize,
    pub disconnects: usize,
    pub address: Option<IpAddr>,
}

/// Connect on start and reconnect after every disconnect, until the event
/// channel closes. Runs independently of the HTTP listeners.
pub async fn run_link_supervisor<S: Station>(
    mut events: mpsc::Receiver<LinkEvent>,
    mut station: S,
) -> LinkStats {
    let mut stats = LinkStats::default();
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Started => {
                info!("station started, connecting");
                connect(&mut station, &mut stats);
            }
            LinkEvent::Disconnected => {
                stats.disconnects += 1;
                stats.address = None;
                warn!(disconnects = stats.disconnects, "link lost, reconnecting");
                connect(&mut station, &mut stats);
            }
            LinkEvent::GotIp(ip) => {
                info!(%ip, "got IP address");
                stats.address = Some(ip);
            }
        }
    }
    info!("link event channel closed");
    stats
}

fn connect<S: Station>(station: &mut S, stats: &mut LinkStats) {
    stats.connect_attempts += 1;
    if let Err(e) = station.connect() {
        warn!(error = %e, attempt = stats.connect_attempts, "connect request failed");
    }
}

/// Station for a host that is already on the network. "Connecting" looks
/// up the outbound interface address and reports it.
pub struct HostStation {
    events: mpsc::Sender<LinkEvent>,
}

/// Host station plus its event stream, primed with [`LinkEvent::Started`].
pub fn host_link() -> (HostStation, mpsc::Receiver<LinkEvent>) {
    let (tx, rx) = mpsc::channel(8);
    tx.try_send(LinkEvent::Started).ok();
    (HostStation { events: tx }, rx)
}

impl Station for HostStation {
    fn connect(&mut self) -> Result<(), NetworkError> {
        let ip = outbound_address().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        self.events
            .try_send(LinkEvent::GotIp(ip))
            .map_err(|e| NetworkError::Connect(e.to_string()))
    }
}

// A connected UDP socket picks a source address without sending anything.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingStation {
        connects: usize,
        fail_first: bool,
    }

    impl Station for CountingStation {
        fn connect(&mut self) -> Result<(), NetworkError> {
            self.connects += 1;
            if self.fail_first && self.connects == 1 {
                return Err(NetworkError::Connect("no AP in range".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn reconnects_after_every_disconnect() {
        let (tx, rx) = mpsc::channel(8);
        let ip: IpAddr = "192.168.4.2".parse().unwrap();
        for event in [
            LinkEvent::Started,
            LinkEvent::Disconnected,
            LinkEvent::Disconnected,
            LinkEvent::GotIp(ip),
        ] {
            tx.send(event).await.unwrap();
        }
        drop(tx);

        let station = CountingStation {
            connects: 0,
            fail_first: true,
        };
        let stats = run_link_supervisor(rx, station).await;

        assert_eq!(stats.connect_attempts, 3);
        assert_eq!(stats.disconnects, 2);
        assert_eq!(stats.address, Some(ip));
    }

    #[tokio::test]
    async fn disconnect_clears_address() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(LinkEvent::GotIp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))))
            .await
            .unwrap();
        tx.send(LinkEvent::Disconnected).await.unwrap();
        drop(tx);

        let station = CountingStation {
            connects: 0,
            fail_first: false,
        };
        let stats = run_link_supervisor(rx, station).await;
        assert_eq!(stats.address, None);
        assert_eq!(stats.connect_attempts, 1);
    }

    #[tokio::test]
    async fn host_link_reports_an_address() {
        let (mut station, mut rx) = host_link();
        assert_eq!(rx.recv().await, Some(LinkEvent::Started));
        station.connect().unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::GotIp(_))));
    }
}
