use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::logbuffer::descriptor;
use bedrock::bits::is_power_of_two;
use hashbrown::HashMap;

pub const SCHEME: &str = "aqueduct";

pub const ENDPOINT_PARAM: &str = "endpoint";
pub const CONTROL_PARAM: &str = "control";
pub const CONTROL_MODE_PARAM: &str = "control-mode";
pub const INTERFACE_PARAM: &str = "interface";
pub const MTU_PARAM: &str = "mtu";
pub const TERM_LENGTH_PARAM: &str = "term-length";
pub const INITIAL_TERM_ID_PARAM: &str = "init-term-id";
pub const TERM_ID_PARAM: &str = "term-id";
pub const TERM_OFFSET_PARAM: &str = "term-offset";
pub const SESSION_ID_PARAM: &str = "session-id";
pub const TAGS_PARAM: &str = "tags";
pub const RELIABLE_PARAM: &str = "reliable";
pub const TETHER_PARAM: &str = "tether";
pub const GROUP_PARAM: &str = "group";
pub const GROUP_TAG_PARAM: &str = "gtag";
pub const CC_PARAM: &str = "cc";
pub const TTL_PARAM: &str = "ttl";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Media {
    Udp,
    Ipc,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlMode {
    None,
    Manual,
    Dynamic,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CongestionControlKind {
    Static,
    Cubic,
}

/// Explicit starting position for a publication joining mid-stream. The
/// three parameters are all-or-nothing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InitialPosition {
    pub initial_term_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
}

/// A parsed `aqueduct:udp?…` / `aqueduct:ipc?…` channel URI. Parsing
/// keeps raw strings; typed accessors validate on demand so the conductor
/// can report the offending parameter precisely.
#[derive(Debug, Clone)]
pub struct ChannelUri {
    media: Media,
    params: HashMap<String, String>,
    original: String,
}

#[inline]
fn invalid(uri: &str, reason: &str) -> DriverError {
    DriverError::Fatal(ErrorKind::InvalidChannel(format!("{}: {}", reason, uri)))
}

impl ChannelUri {
    pub fn parse(uri: &str) -> DriverResult<ChannelUri> {
        let body = uri
            .strip_prefix(SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| invalid(uri, "channel must start with 'aqueduct:'"))?;

        let (media_str, query) = match body.find('?') {
            Some(pos) => (&body[..pos], &body[pos + 1..]),
            None => (body, ""),
        };

        let media = match media_str {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => return Err(invalid(uri, &format!("unknown media '{}'", other))),
        };

        let mut params = HashMap::new();
        if !query.is_empty() {
            for pair in query.split('|') {
                let mut split = pair.splitn(2, '=');
                let key = split.next().unwrap_or("");
                let value = split
                    .next()
                    .ok_or_else(|| invalid(uri, &format!("parameter '{}' has no value", key)))?;
                if key.is_empty() {
                    return Err(invalid(uri, "empty parameter name"));
                }
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(ChannelUri {
            media,
            params,
            original: uri.to_string(),
        })
    }

    #[inline]
    pub fn media(&self) -> Media {
        self.media
    }

    #[inline]
    pub fn original(&self) -> &str {
        &self.original
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    #[inline]
    pub fn endpoint(&self) -> Option<&str> {
        self.get(ENDPOINT_PARAM)
    }

    #[inline]
    pub fn control(&self) -> Option<&str> {
        self.get(CONTROL_PARAM)
    }

    #[inline]
    pub fn interface(&self) -> Option<&str> {
        self.get(INTERFACE_PARAM)
    }

    pub fn control_mode(&self) -> DriverResult<ControlMode> {
        match self.get(CONTROL_MODE_PARAM) {
            None => Ok(ControlMode::None),
            Some("manual") => Ok(ControlMode::Manual),
            Some("dynamic") => Ok(ControlMode::Dynamic),
            Some(other) => Err(invalid(
                &self.original,
                &format!("unknown control-mode '{}'", other),
            )),
        }
    }

    pub fn mtu(&self) -> DriverResult<Option<usize>> {
        match self.get(MTU_PARAM) {
            None => Ok(None),
            Some(raw) => {
                let mtu: usize = raw
                    .parse()
                    .map_err(|_| invalid(&self.original, "mtu is not a number"))?;
                if mtu < 64 || mtu > 65504 || mtu % 32 != 0 {
                    return Err(invalid(&self.original, "mtu must be frame aligned and sane"));
                }
                Ok(Some(mtu))
            }
        }
    }

    pub fn term_length(&self) -> DriverResult<Option<usize>> {
        match self.get(TERM_LENGTH_PARAM) {
            None => Ok(None),
            Some(raw) => {
                let length: usize = raw
                    .parse()
                    .map_err(|_| invalid(&self.original, "term-length is not a number"))?;
                descriptor::check_term_length(length)
                    .map_err(|_| invalid(&self.original, "term-length invalid"))?;
                Ok(Some(length))
            }
        }
    }

    pub fn session_id(&self) -> DriverResult<Option<i32>> {
        match self.get(SESSION_ID_PARAM) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i32>()
                .map(Some)
                .map_err(|_| invalid(&self.original, "session-id is not a number")),
        }
    }

    /// init-term-id / term-id / term-offset must be given together.
    pub fn initial_position(&self) -> DriverResult<Option<InitialPosition>> {
        let raw = (
            self.get(INITIAL_TERM_ID_PARAM),
            self.get(TERM_ID_PARAM),
            self.get(TERM_OFFSET_PARAM),
        );

        match raw {
            (None, None, None) => Ok(None),
            (Some(init), Some(term), Some(offset)) => {
                let initial_term_id = init
                    .parse::<i32>()
                    .map_err(|_| invalid(&self.original, "init-term-id is not a number"))?;
                let term_id = term
                    .parse::<i32>()
                    .map_err(|_| invalid(&self.original, "term-id is not a number"))?;
                let term_offset = offset
                    .parse::<i32>()
                    .map_err(|_| invalid(&self.original, "term-offset is not a number"))?;

                if term_offset < 0 || term_offset % 32 != 0 {
                    return Err(invalid(&self.original, "term-offset must be frame aligned"));
                }
                if term_id.wrapping_sub(initial_term_id) < 0 {
                    return Err(invalid(&self.original, "term-id precedes init-term-id"));
                }

                Ok(Some(InitialPosition {
                    initial_term_id,
                    term_id,
                    term_offset,
                }))
            }
            _ => Err(invalid(
                &self.original,
                "init-term-id, term-id and term-offset must be specified together",
            )),
        }
    }

    fn bool_param(&self, key: &str, default: bool) -> DriverResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(invalid(
                &self.original,
                &format!("'{}' must be true or false, got '{}'", key, other),
            )),
        }
    }

    #[inline]
    pub fn reliable(&self) -> DriverResult<bool> {
        self.bool_param(RELIABLE_PARAM, true)
    }

    #[inline]
    pub fn tether(&self) -> DriverResult<bool> {
        self.bool_param(TETHER_PARAM, true)
    }

    #[inline]
    pub fn group(&self) -> DriverResult<bool> {
        self.bool_param(GROUP_PARAM, false)
    }

    pub fn congestion_control(&self) -> DriverResult<Option<CongestionControlKind>> {
        match self.get(CC_PARAM) {
            None => Ok(None),
            Some("static") => Ok(Some(CongestionControlKind::Static)),
            Some("cubic") => Ok(Some(CongestionControlKind::Cubic)),
            Some(other) => Err(invalid(&self.original, &format!("unknown cc '{}'", other))),
        }
    }

    pub fn ttl(&self) -> DriverResult<Option<u32>> {
        match self.get(TTL_PARAM) {
            None => Ok(None),
            Some(raw) => {
                let ttl: u32 = raw
                    .parse()
                    .map_err(|_| invalid(&self.original, "ttl is not a number"))?;
                if ttl > 255 {
                    return Err(invalid(&self.original, "ttl exceeds 255"));
                }
                Ok(Some(ttl))
            }
        }
    }

    pub fn tags(&self) -> DriverResult<Vec<i64>> {
        match self.get(TAGS_PARAM) {
            None => Ok(Vec::new()),
            Some(raw) => raw
                .split(',')
                .map(|tag| {
                    tag.parse::<i64>()
                        .map_err(|_| invalid(&self.original, "tags must be numeric"))
                })
                .collect(),
        }
    }

    pub fn group_tag(&self) -> DriverResult<Option<i64>> {
        match self.get(GROUP_TAG_PARAM) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| invalid(&self.original, "gtag is not a number")),
        }
    }

    /// Parameters that must agree for two registrations to share one
    /// stream entity.
    pub fn matches_geometry(&self, other: &ChannelUri) -> bool {
        self.get(MTU_PARAM) == other.get(MTU_PARAM)
            && self.get(TERM_LENGTH_PARAM) == other.get(TERM_LENGTH_PARAM)
    }
}

/// Sanity check used when a subscription supplies a receiver window via
/// congestion control: window values must be power-of-two friendly.
#[inline]
pub fn check_initial_window(window: usize, mtu: usize) -> DriverResult<()> {
    if window < mtu || !is_power_of_two(window) {
        return Err(DriverError::Fatal(ErrorKind::InvalidChannel(format!(
            "initial window {} must be a power of two >= mtu {}",
            window, mtu
        ))));
    }
    Ok(())
}
