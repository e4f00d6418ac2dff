use crate::driver::endpoint::UdpTransport;
use crate::error::DriverResult;
use std::net::SocketAddr;

/// Where a publication's frames go: a single unicast/multicast address,
/// a manually managed destination list, or a dynamic list learned from
/// the status messages of whoever is listening.
pub enum DestinationTracker {
    Single {
        address: SocketAddr,
    },
    Manual {
        destinations: Vec<ManualDestination>,
    },
    Dynamic {
        destinations: Vec<DynamicDestination>,
        destination_timeout_ns: i64,
    },
}

pub struct ManualDestination {
    pub registration_id: i64,
    pub address: SocketAddr,
    pub time_of_last_activity_ns: i64,
}

pub struct DynamicDestination {
    pub receiver_id: i64,
    pub address: SocketAddr,
    pub time_of_last_activity_ns: i64,
}

impl DestinationTracker {
    pub fn single(address: SocketAddr) -> DestinationTracker {
        DestinationTracker::Single { address }
    }

    pub fn manual() -> DestinationTracker {
        DestinationTracker::Manual {
            destinations: Vec::new(),
        }
    }

    pub fn dynamic(destination_timeout_ns: i64) -> DestinationTracker {
        DestinationTracker::Dynamic {
            destinations: Vec::new(),
            destination_timeout_ns,
        }
    }

    #[inline]
    pub fn is_manual(&self) -> bool {
        matches!(self, DestinationTracker::Manual { .. })
    }

    pub fn destination_count(&self) -> usize {
        match self {
            DestinationTracker::Single { .. } => 1,
            DestinationTracker::Manual { destinations } => destinations.len(),
            DestinationTracker::Dynamic { destinations, .. } => destinations.len(),
        }
    }

    /// Manual mode: explicit add keyed by the destination registration.
    pub fn add_destination(&mut self, registration_id: i64, address: SocketAddr, now_ns: i64) {
        if let DestinationTracker::Manual { destinations } = self {
            if !destinations.iter().any(|d| d.address == address) {
                destinations.push(ManualDestination {
                    registration_id,
                    address,
                    time_of_last_activity_ns: now_ns,
                });
            }
        }
    }

    /// Manual mode: remove by address. Returns whether anything matched.
    pub fn remove_destination(&mut self, address: &SocketAddr) -> bool {
        if let DestinationTracker::Manual { destinations } = self {
            let before = destinations.len();
            destinations.retain(|d| d.address != *address);
            return destinations.len() != before;
        }
        false
    }

    /// A status message refreshes the destination it came from; dynamic
    /// mode learns new receivers keyed by `(receiver_id, address)`.
    pub fn on_status_message(&mut self, receiver_id: i64, src: SocketAddr, now_ns: i64) {
        match self {
            DestinationTracker::Single { .. } => (),
            DestinationTracker::Manual { destinations } => {
                if let Some(dest) = destinations.iter_mut().find(|d| d.address == src) {
                    dest.time_of_last_activity_ns = now_ns;
                }
            }
            DestinationTracker::Dynamic { destinations, .. } => {
                match destinations
                    .iter_mut()
                    .find(|d| d.receiver_id == receiver_id && d.address == src)
                {
                    Some(dest) => dest.time_of_last_activity_ns = now_ns,
                    None => destinations.push(DynamicDestination {
                        receiver_id,
                        address: src,
                        time_of_last_activity_ns: now_ns,
                    }),
                }
            }
        }
    }

    /// Fan a frame out to every live destination. Dynamic destinations
    /// silent past their timeout are pruned here, on the send path.
    /// Returns the minimum bytes accepted across destinations, so a short
    /// send anywhere registers as back-pressure.
    pub fn send(
        &mut self,
        transport: &UdpTransport,
        buf: &[u8],
        now_ns: i64,
    ) -> DriverResult<usize> {
        match self {
            DestinationTracker::Single { address } => transport.send_to(buf, address),
            DestinationTracker::Manual { destinations } => {
                let mut min_sent = buf.len();
                for dest in destinations.iter() {
                    min_sent = min_sent.min(transport.send_to(buf, &dest.address)?);
                }
                if destinations.is_empty() {
                    return Ok(buf.len());
                }
                Ok(min_sent)
            }
            DestinationTracker::Dynamic {
                destinations,
                destination_timeout_ns,
            } => {
                destinations.retain(|d| now_ns - d.time_of_last_activity_ns < *destination_timeout_ns);
                let mut min_sent = buf.len();
                for dest in destinations.iter() {
                    min_sent = min_sent.min(transport.send_to(buf, &dest.address)?);
                }
                if destinations.is_empty() {
                    return Ok(buf.len());
                }
                Ok(min_sent)
            }
        }
    }

    /// Swap the unicast address after a re-resolution.
    pub fn update_single_address(&mut self, address: SocketAddr) {
        if let DestinationTracker::Single { address: current } = self {
            *current = address;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn loopback_transport() -> UdpTransport {
        UdpTransport::bind(&addr(0)).unwrap()
    }

    #[test]
    fn test_manual_add_remove() {
        let mut tracker = DestinationTracker::manual();
        tracker.add_destination(1, addr(24326), 0);
        tracker.add_destination(2, addr(24327), 0);
        tracker.add_destination(3, addr(24327), 0);

        assert_eq!(tracker.destination_count(), 2);
        assert!(tracker.remove_destination(&addr(24327)));
        assert!(!tracker.remove_destination(&addr(24327)));
        assert_eq!(tracker.destination_count(), 1);
    }

    #[test]
    fn test_manual_fan_out_reaches_all_destinations() {
        let receiver_a = loopback_transport();
        let receiver_b = loopback_transport();
        let sender = loopback_transport();

        let mut tracker = DestinationTracker::manual();
        tracker.add_destination(1, receiver_a.local_addr(), 0);
        tracker.add_destination(2, receiver_b.local_addr(), 0);

        let sent = tracker.send(&sender, b"frame", 0).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        for receiver in [&receiver_a, &receiver_b] {
            let mut got = false;
            for _ in 0..1000 {
                if receiver.recv_from(&mut buf).unwrap().is_some() {
                    got = true;
                    break;
                }
                std::thread::yield_now();
            }
            assert!(got, "destination missed the fan-out");
        }
    }

    #[test]
    fn test_dynamic_learns_and_prunes() {
        let timeout = 1_000;
        let mut tracker = DestinationTracker::dynamic(timeout);
        let transport = loopback_transport();

        tracker.on_status_message(1, addr(30001), 0);
        tracker.on_status_message(2, addr(30002), 500);
        assert_eq!(tracker.destination_count(), 2);

        // Receiver 1 refreshes; receiver 2 goes silent past the timeout.
        tracker.on_status_message(1, addr(30001), 1_200);
        tracker.send(&transport, b"x", 1_600).unwrap();
        assert_eq!(tracker.destination_count(), 1);
    }

    #[test]
    fn test_empty_fan_out_counts_as_full_send() {
        let transport = loopback_transport();
        let mut tracker = DestinationTracker::manual();
        assert_eq!(tracker.send(&transport, b"frame", 0).unwrap(), 5);
    }
}
