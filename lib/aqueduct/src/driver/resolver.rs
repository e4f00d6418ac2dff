use crate::driver::endpoint::UdpTransport;
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::protocol::{self, resolution::ResolutionRecord};
use bedrock::logging;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Turns `host:port` strings from channel URIs into socket addresses.
pub trait NameResolver: Send {
    fn resolve(&mut self, name: &str) -> DriverResult<SocketAddr>;
}

#[inline]
fn split_host_port(name: &str) -> DriverResult<(&str, u16)> {
    let pos = name.rfind(':').ok_or_else(|| {
        DriverError::Fatal(ErrorKind::InvalidChannel(format!(
            "'{}' is not host:port",
            name
        )))
    })?;
    let port = name[pos + 1..]
        .parse::<u16>()
        .map_err(|_| DriverError::Fatal(ErrorKind::InvalidChannel(format!(
            "'{}' has a malformed port",
            name
        ))))?;
    Ok((&name[..pos], port))
}

/// System resolver: literal addresses first, then the OS lookup.
pub struct StdNameResolver;

impl StdNameResolver {
    #[inline]
    pub fn new() -> StdNameResolver {
        StdNameResolver
    }
}

impl NameResolver for StdNameResolver {
    fn resolve(&mut self, name: &str) -> DriverResult<SocketAddr> {
        if let Ok(addr) = name.parse::<SocketAddr>() {
            return Ok(addr);
        }

        name.to_socket_addrs()
            .map_err(|_| DriverError::Fatal(ErrorKind::AddrParse))?
            .next()
            .ok_or(DriverError::Fatal(ErrorKind::AddrParse))
    }
}

pub const SELF_RESOLUTION_INTERVAL_MS: i64 = 1_000;
pub const NEIGHBOR_RESOLUTION_INTERVAL_MS: i64 = 2_000;
pub const TIMEOUT_MS: i64 = 10_000;

struct Neighbor {
    address: SocketAddr,
    time_of_last_activity_ms: i64,
}

#[derive(Clone)]
struct CacheEntry {
    name: String,
    address: IpAddr,
    port: u16,
    time_of_last_activity_ms: i64,
}

/// Gossip-style resolver: drivers advertise their own `(name, address,
/// port)` to a neighbor set and forward what they have learned, so names
/// resolve across hosts without DNS. Runs on the conductor's duty cycle.
pub struct DriverNameResolver {
    name: String,
    transport: UdpTransport,
    bootstrap: Option<SocketAddr>,
    neighbors: Vec<Neighbor>,
    cache: Vec<CacheEntry>,
    self_deadline_ms: i64,
    neighbor_deadline_ms: i64,
    mtu: usize,
    log: logging::Logger,
}

impl DriverNameResolver {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        bind_addr: SocketAddr,
        bootstrap: Option<SocketAddr>,
        mtu: usize,
        log: L,
    ) -> DriverResult<DriverNameResolver> {
        let resolver_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null_logger(),
        };

        Ok(DriverNameResolver {
            name: name.to_string(),
            transport: UdpTransport::bind(&bind_addr)?,
            bootstrap,
            neighbors: Vec::new(),
            cache: Vec::new(),
            self_deadline_ms: 0,
            neighbor_deadline_ms: 0,
            mtu,
            log: resolver_log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    #[inline]
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Look up a learned name without touching the OS resolver.
    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.cache
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| SocketAddr::new(entry.address, entry.port))
    }

    pub fn do_work(&mut self, now_ms: i64) -> DriverResult<usize> {
        let mut work_count = self.poll_frames(now_ms)?;

        if now_ms >= self.self_deadline_ms {
            self.self_deadline_ms = now_ms + SELF_RESOLUTION_INTERVAL_MS;
            self.send_self_record(now_ms)?;
            work_count += 1;
        }

        if now_ms >= self.neighbor_deadline_ms {
            self.neighbor_deadline_ms = now_ms + NEIGHBOR_RESOLUTION_INTERVAL_MS;
            self.send_cache_records(now_ms)?;
            work_count += 1;
        }

        self.neighbors
            .retain(|n| now_ms - n.time_of_last_activity_ms < TIMEOUT_MS);
        self.cache
            .retain(|e| now_ms - e.time_of_last_activity_ms < TIMEOUT_MS);

        Ok(work_count)
    }

    fn poll_frames(&mut self, now_ms: i64) -> DriverResult<usize> {
        let mut buf = [0u8; 64 * 1024];
        let mut work_count = 0;

        while let Some((len, src)) = self.transport.recv_from(&mut buf)? {
            if len < protocol::header::LENGTH
                || protocol::header::frame_type(&buf) != protocol::HDR_TYPE_RES
            {
                continue;
            }

            self.on_neighbor_activity(src, now_ms);

            let mut offset = protocol::resolution::RECORDS_OFFSET;
            while let Some((record, next)) = protocol::resolution::decode_record(&buf[..len], offset)
            {
                let address = if record.is_self {
                    // Trust the datagram source over a self-reported
                    // address that may be unroutable from here.
                    src.ip()
                } else {
                    record.address
                };
                self.learn(&record.name, address, record.port, now_ms);
                offset = next;
            }
            work_count += 1;
        }

        Ok(work_count)
    }

    fn on_neighbor_activity(&mut self, src: SocketAddr, now_ms: i64) {
        match self.neighbors.iter_mut().find(|n| n.address == src) {
            Some(neighbor) => neighbor.time_of_last_activity_ms = now_ms,
            None => {
                logging::debug!(self.log, "neighbor discovered";
                                "context" => "resolver",
                                "neighbor" => %src);
                self.neighbors.push(Neighbor {
                    address: src,
                    time_of_last_activity_ms: now_ms,
                });
            }
        }
    }

    fn learn(&mut self, name: &str, address: IpAddr, port: u16, now_ms: i64) {
        if name == self.name {
            return;
        }

        match self.cache.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.address = address;
                entry.port = port;
                entry.time_of_last_activity_ms = now_ms;
            }
            None => self.cache.push(CacheEntry {
                name: name.to_string(),
                address,
                port,
                time_of_last_activity_ms: now_ms,
            }),
        }
    }

    fn destinations(&self) -> Vec<SocketAddr> {
        let mut destinations: Vec<SocketAddr> =
            self.neighbors.iter().map(|n| n.address).collect();
        if let Some(bootstrap) = self.bootstrap {
            if !destinations.contains(&bootstrap) {
                destinations.push(bootstrap);
            }
        }
        destinations
    }

    fn send_self_record(&mut self, _now_ms: i64) -> DriverResult<()> {
        let local = self.local_addr();
        let record = ResolutionRecord {
            is_self: true,
            address: local.ip(),
            port: local.port(),
            age_ms: 0,
            name: self.name.clone(),
        };

        let mut buf = vec![0u8; self.mtu];
        let length = match protocol::resolution::encode_record(
            &mut buf,
            protocol::resolution::RECORDS_OFFSET,
            &record,
        ) {
            Some(len) => protocol::resolution::RECORDS_OFFSET + len,
            None => return Ok(()),
        };
        protocol::header::encode(
            &mut buf,
            protocol::HDR_TYPE_RES,
            0,
            length as i32,
            0,
            0,
            0,
            0,
        );

        for dst in self.destinations() {
            let _ = self.transport.send_to(&buf[..length], &dst);
        }

        Ok(())
    }

    fn send_cache_records(&mut self, now_ms: i64) -> DriverResult<()> {
        if self.cache.is_empty() || self.neighbors.is_empty() {
            return Ok(());
        }

        let mut buf = vec![0u8; self.mtu];
        let mut offset = protocol::resolution::RECORDS_OFFSET;

        for entry in self.cache.iter() {
            let record = ResolutionRecord {
                is_self: false,
                address: entry.address,
                port: entry.port,
                age_ms: (now_ms - entry.time_of_last_activity_ms).max(0) as i32,
                name: entry.name.clone(),
            };
            match protocol::resolution::encode_record(&mut buf, offset, &record) {
                Some(len) => offset += len,
                None => break,
            }
        }

        protocol::header::encode(
            &mut buf,
            protocol::HDR_TYPE_RES,
            0,
            offset as i32,
            0,
            0,
            0,
            0,
        );

        for dst in self.destinations() {
            let _ = self.transport.send_to(&buf[..offset], &dst);
        }

        Ok(())
    }
}

impl NameResolver for DriverNameResolver {
    fn resolve(&mut self, name: &str) -> DriverResult<SocketAddr> {
        if let Ok(addr) = name.parse::<SocketAddr>() {
            return Ok(addr);
        }

        let (host, port) = split_host_port(name)?;
        if let Some(entry) = self.cache.iter().find(|e| e.name == host) {
            return Ok(SocketAddr::new(entry.address, port));
        }

        StdNameResolver::new().resolve(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_resolver_parses_literals() {
        let mut resolver = StdNameResolver::new();
        let addr = resolver.resolve("127.0.0.1:24325").unwrap();
        assert_eq!(addr.port(), 24325);

        let addr = resolver.resolve("localhost:8080").unwrap();
        assert_eq!(addr.port(), 8080);

        assert!(resolver.resolve("definitely-not-a-host.invalid:1").is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("driver-b:8050").unwrap(), ("driver-b", 8050));
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("bad:port:xyz").is_err());
    }

    fn make_resolver(name: &str, bootstrap: Option<SocketAddr>) -> DriverNameResolver {
        DriverNameResolver::new(
            name,
            "127.0.0.1:0".parse().unwrap(),
            bootstrap,
            1408,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_gossip_between_two_drivers() {
        let mut a = make_resolver("driver-a", None);
        let mut b = make_resolver("driver-b", Some(a.local_addr()));

        let mut now_ms = 0i64;
        for _ in 0..200 {
            now_ms += 100;
            b.do_work(now_ms).unwrap();
            a.do_work(now_ms).unwrap();

            if a.lookup("driver-b").is_some() && b.lookup("driver-a").is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        // B advertised itself to its bootstrap neighbor; A answered with
        // its own record once B became a neighbor.
        let b_addr = a.lookup("driver-b").expect("driver-b never learned");
        assert_eq!(b_addr.port(), b.local_addr().port());
        let a_addr = b.lookup("driver-a").expect("driver-a never learned");
        assert_eq!(a_addr.port(), a.local_addr().port());

        assert!(a.neighbor_count() >= 1);
        assert_eq!(b.resolve("driver-a:9000").unwrap().port(), 9000);
    }

    #[test]
    fn test_silent_entries_time_out() {
        let mut resolver = make_resolver("driver-a", None);
        resolver.learn("driver-x", "10.0.0.9".parse().unwrap(), 8050, 0);
        assert!(resolver.lookup("driver-x").is_some());

        resolver.do_work(TIMEOUT_MS + 1).unwrap();
        assert!(resolver.lookup("driver-x").is_none());
    }
}
