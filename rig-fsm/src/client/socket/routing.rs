//! Output routing for the soft-real-time host
//!
//! Each output column of the matrix (one per output line, plus the serial
//! column) is bound to a destination on the host. Routes are written in config
//! files as short strings:
//!
//! | string                     | route                                   |
//! |----------------------------|-----------------------------------------|
//! | `dout:<line>`              | digital output line                     |
//! | `trig:<line>`              | trigger line                            |
//! | `ext:<module>`             | external module (sound, image, ...)     |
//! | `sound:<module>`           | deprecated alias for `ext`              |
//! | `sched_wave`               | schedule-wave trigger                   |
//! | `tcp:<host>:<port>:<tmpl>` | text message to a TCP listener          |
//! | `udp:<host>:<port>:<tmpl>` | text message to a UDP listener          |
//! | `noop`                     | column ignored                          |

use super::codec::percent_encode;
use crate::types::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Destination of one output column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputRoute {
    Dout { line: u32 },
    Trig { line: u32 },
    Ext { module: u32 },
    SchedWave,
    Tcp { host: String, port: u16, template: String },
    Udp { host: String, port: u16, template: String },
    Noop,
}

/// Escapes allowed in a network route template
///
/// `%v` column value, `%t` timestamp, `%T` trial, `%s` state, `%c` column, `%%` literal.
const TEMPLATE_ESCAPES: &[char] = &['v', 't', 'T', 's', 'c', '%'];

impl OutputRoute {
    /// Type tag sent to the host
    pub fn wire_type(&self) -> &'static str {
        match self {
            OutputRoute::Dout { .. } => "dout",
            OutputRoute::Trig { .. } => "trig",
            OutputRoute::Ext { .. } => "ext",
            OutputRoute::SchedWave => "sched_wave",
            OutputRoute::Tcp { .. } => "tcp",
            OutputRoute::Udp { .. } => "udp",
            OutputRoute::Noop => "noop",
        }
    }

    /// Type-specific data sent to the host
    pub fn wire_data(&self) -> String {
        match self {
            OutputRoute::Dout { line } | OutputRoute::Trig { line } => line.to_string(),
            OutputRoute::Ext { module } => module.to_string(),
            OutputRoute::Tcp { host, port, template } | OutputRoute::Udp { host, port, template } => {
                format!("{}:{}:{}", host, port, template)
            }
            OutputRoute::SchedWave | OutputRoute::Noop => String::new(),
        }
    }

    /// Check network templates for unknown escapes
    pub fn validate(&self) -> Result<()> {
        match self {
            OutputRoute::Tcp { template, .. } | OutputRoute::Udp { template, .. } => validate_template(template),
            _ => Ok(()),
        }
    }
}

fn validate_template(template: &str) -> Result<()> {
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some(escape) if TEMPLATE_ESCAPES.contains(&escape) => {}
            Some(escape) => {
                return Err(ClientError::Route(format!(
                    "unknown escape '%{}' in template '{}'",
                    escape, template
                )))
            }
            None => return Err(ClientError::Route(format!("dangling '%' in template '{}'", template))),
        }
    }
    Ok(())
}

fn parse_number<T: FromStr>(text: &str, route: &str) -> Result<T> {
    text.parse()
        .map_err(|_| ClientError::Route(format!("invalid number '{}' in route '{}'", text, route)))
}

fn parse_network(rest: &str, route: &str) -> Result<(String, u16, String)> {
    let mut parts = rest.splitn(3, ':');
    let (Some(host), Some(port), Some(template)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ClientError::Route(format!("expected host:port:template in '{}'", route)));
    };
    if host.is_empty() {
        return Err(ClientError::Route(format!("empty host in '{}'", route)));
    }
    validate_template(template)?;
    Ok((host.to_string(), parse_number(port, route)?, template.to_string()))
}

impl FromStr for OutputRoute {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = match s.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (s, None),
        };
        match (kind, rest) {
            ("dout", Some(line)) => Ok(OutputRoute::Dout {
                line: parse_number(line, s)?,
            }),
            ("trig", Some(line)) => Ok(OutputRoute::Trig {
                line: parse_number(line, s)?,
            }),
            ("ext", None) => Ok(OutputRoute::Ext { module: 0 }),
            ("ext", Some(module)) => Ok(OutputRoute::Ext {
                module: parse_number(module, s)?,
            }),
            ("sound", module) => {
                log::warn!("Output route '{}' is deprecated; use 'ext' instead", s);
                let module = module.map(|m| parse_number(m, s)).transpose()?.unwrap_or(0);
                Ok(OutputRoute::Ext { module })
            }
            ("sched_wave", None) => Ok(OutputRoute::SchedWave),
            ("noop", None) => Ok(OutputRoute::Noop),
            ("tcp", Some(rest)) => {
                let (host, port, template) = parse_network(rest, s)?;
                Ok(OutputRoute::Tcp { host, port, template })
            }
            ("udp", Some(rest)) => {
                let (host, port, template) = parse_network(rest, s)?;
                Ok(OutputRoute::Udp { host, port, template })
            }
            _ => Err(ClientError::Route(format!("unrecognised output route '{}'", s))),
        }
    }
}

impl fmt::Display for OutputRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputRoute::SchedWave | OutputRoute::Noop => write!(f, "{}", self.wire_type()),
            _ => write!(f, "{}:{}", self.wire_type(), self.wire_data()),
        }
    }
}

impl TryFrom<String> for OutputRoute {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OutputRoute> for String {
    fn from(route: OutputRoute) -> Self {
        route.to_string()
    }
}

/// One `dout` per output line followed by `ext` for the serial column
pub fn default_routes(n_outputs: usize) -> Vec<OutputRoute> {
    (0..n_outputs as u32)
        .map(|line| OutputRoute::Dout { line })
        .chain(std::iter::once(OutputRoute::Ext { module: 0 }))
        .collect()
}

/// Encode routes for the `SET STATE MATRIX` line
///
/// Items are `\x01<type>\x02<data>`, concatenated and percent-encoded.
pub fn encode_routes(routes: &[OutputRoute]) -> String {
    let mut spec = String::new();
    for route in routes {
        spec.push('\x01');
        spec.push_str(route.wire_type());
        spec.push('\x02');
        spec.push_str(&route.wire_data());
    }
    percent_encode(&spec)
}
