// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Server configuration: a small directive file format parsed with [`nom`].
//!
//! The format is a flat list of directives, each `name arg arg … ;`, with
//! `#` line comments. Sizes accept `k`/`m` suffixes, durations accept
//! `ms`/`s`/`m`. `-g` passes extra directives inline; they are applied
//! after the file, so they win.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use nom::{IResult, Parser,
          branch::alt,
          bytes::complete::{is_not, take_while1},
          character::complete::{char, multispace0},
          combinator::opt,
          multi::many0,
          sequence::{delimited, preceded, terminated}};

/// One parsed `name arg… ;` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("syntax error near {0:?}")]
    Syntax(String),
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
    #[error("directive {0:?}: invalid value {1:?}")]
    InvalidValue(String, String),
    #[error("directive {0:?}: wrong number of arguments")]
    WrongArgCount(String),
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// All knobs the core consults, with working defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory every relative path below is resolved against.
    pub prefix: PathBuf,
    pub worker_processes: usize,
    pub listen: Vec<SocketAddr>,
    pub pid_path: PathBuf,
    pub error_log: Option<PathBuf>,
    pub worker_connections: usize,
    pub client_header_buffer_size: usize,
    pub client_header_timeout: Duration,
    pub client_body_buffer_size: usize,
    /// 0 means unlimited.
    pub client_max_body_size: u64,
    pub client_body_timeout: Duration,
    pub client_body_temp_path: PathBuf,
    pub client_body_in_file_only: bool,
    pub lingering_timeout: Duration,
    pub lingering_time: Duration,
    pub shutdown_timeout: Duration,
    pub accept_mutex: bool,
    pub accept_mutex_delay: Duration,
    /// 0 means "use the system clock on every tick".
    pub timer_resolution: Duration,
    pub worker_cpu_affinity: Vec<usize>,
    pub worker_rlimit_nofile: Option<u64>,
    pub worker_priority: i32,
    pub user: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub daemon: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("."),
            worker_processes: 1,
            listen: vec![],
            pid_path: PathBuf::from("stoker.pid"),
            error_log: None,
            worker_connections: 512,
            client_header_buffer_size: 4 * 1024,
            client_header_timeout: Duration::from_secs(60),
            client_body_buffer_size: 16 * 1024,
            client_max_body_size: 1024 * 1024,
            client_body_timeout: Duration::from_secs(60),
            client_body_temp_path: PathBuf::from("client_body_temp"),
            client_body_in_file_only: false,
            lingering_timeout: Duration::from_secs(5),
            lingering_time: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            accept_mutex: true,
            accept_mutex_delay: Duration::from_millis(500),
            timer_resolution: Duration::ZERO,
            worker_cpu_affinity: vec![],
            worker_rlimit_nofile: None,
            worker_priority: 0,
            user: None,
            working_directory: None,
            daemon: false,
        }
    }
}

impl Config {
    /// Parse a directive file plus optional `-g` inline directives.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on syntax errors, unknown directives, or
    /// invalid values.
    pub fn from_sources(
        prefix: PathBuf,
        file: Option<&str>,
        inline: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = Self {
            prefix,
            ..Self::default()
        };

        if let Some(src) = file {
            for d in parse_directives(src)? {
                cfg.apply(&d)?;
            }
        }
        if let Some(src) = inline {
            for d in parse_directives(src)? {
                cfg.apply(&d)?;
            }
        }

        if cfg.listen.is_empty() {
            cfg.listen.push(
                "127.0.0.1:8080"
                    .parse()
                    .expect("default listen address is valid"),
            );
        }

        Ok(cfg)
    }

    /// Resolve a configured path against the prefix.
    #[must_use]
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.prefix.join(path)
        }
    }

    fn apply(&mut self, d: &Directive) -> Result<(), ConfigError> {
        fn one<'a>(d: &'a Directive) -> Result<&'a str, ConfigError> {
            match d.args.as_slice() {
                [v] => Ok(v.as_str()),
                _ => Err(ConfigError::WrongArgCount(d.name.clone())),
            }
        }
        let invalid = |v: &str| ConfigError::InvalidValue(d.name.clone(), v.to_string());

        match d.name.as_str() {
            "worker_processes" => {
                let v = one(d)?;
                self.worker_processes = v.parse().map_err(|_| invalid(v))?;
            }
            "listen" => {
                let v = one(d)?;
                let addr = if v.contains(':') {
                    v.parse().map_err(|_| invalid(v))?
                } else {
                    let port: u16 = v.parse().map_err(|_| invalid(v))?;
                    SocketAddr::from(([0, 0, 0, 0], port))
                };
                self.listen.push(addr);
            }
            "pid" => self.pid_path = PathBuf::from(one(d)?),
            "error_log" => self.error_log = Some(PathBuf::from(one(d)?)),
            "worker_connections" => {
                let v = one(d)?;
                self.worker_connections = v.parse().map_err(|_| invalid(v))?;
            }
            "client_header_buffer_size" => {
                let v = one(d)?;
                self.client_header_buffer_size = parse_size(v).ok_or_else(|| invalid(v))? as usize;
            }
            "client_header_timeout" => {
                let v = one(d)?;
                self.client_header_timeout = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "client_body_buffer_size" => {
                let v = one(d)?;
                self.client_body_buffer_size = parse_size(v).ok_or_else(|| invalid(v))? as usize;
            }
            "client_max_body_size" => {
                let v = one(d)?;
                self.client_max_body_size = parse_size(v).ok_or_else(|| invalid(v))?;
            }
            "client_body_timeout" => {
                let v = one(d)?;
                self.client_body_timeout = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "client_body_temp_path" => self.client_body_temp_path = PathBuf::from(one(d)?),
            "client_body_in_file_only" => {
                self.client_body_in_file_only = parse_switch(d, one(d)?)?;
            }
            "lingering_timeout" => {
                let v = one(d)?;
                self.lingering_timeout = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "lingering_time" => {
                let v = one(d)?;
                self.lingering_time = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "shutdown_timeout" => {
                let v = one(d)?;
                self.shutdown_timeout = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "accept_mutex" => self.accept_mutex = parse_switch(d, one(d)?)?,
            "accept_mutex_delay" => {
                let v = one(d)?;
                self.accept_mutex_delay = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "timer_resolution" => {
                let v = one(d)?;
                self.timer_resolution = parse_duration(v).ok_or_else(|| invalid(v))?;
            }
            "worker_cpu_affinity" => {
                self.worker_cpu_affinity = d
                    .args
                    .iter()
                    .map(|a| a.parse().map_err(|_| invalid(a)))
                    .collect::<Result<_, _>>()?;
            }
            "worker_rlimit_nofile" => {
                let v = one(d)?;
                self.worker_rlimit_nofile = Some(v.parse().map_err(|_| invalid(v))?);
            }
            "worker_priority" => {
                let v = one(d)?;
                self.worker_priority = v.parse().map_err(|_| invalid(v))?;
            }
            "user" => self.user = Some(one(d)?.to_string()),
            "working_directory" => self.working_directory = Some(PathBuf::from(one(d)?)),
            "daemon" => self.daemon = parse_switch(d, one(d)?)?,
            other => return Err(ConfigError::UnknownDirective(other.to_string())),
        }
        Ok(())
    }
}

fn parse_switch(d: &Directive, v: &str) -> Result<bool, ConfigError> {
    match v {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(d.name.clone(), v.to_string())),
    }
}

/// `"16k"` → 16384, `"1m"` → 1048576, plain numbers pass through.
#[must_use]
pub fn parse_size(v: &str) -> Option<u64> {
    let (digits, mult) = match v.as_bytes().last()? {
        b'k' | b'K' => (&v[..v.len() - 1], 1024),
        b'm' | b'M' => (&v[..v.len() - 1], 1024 * 1024),
        _ => (v, 1),
    };
    digits.parse::<u64>().ok().map(|n| n * mult)
}

/// `"50ms"`, `"60s"`, `"5m"`, plain numbers are seconds.
#[must_use]
pub fn parse_duration(v: &str) -> Option<Duration> {
    if let Some(ms) = v.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(m) = v.strip_suffix('m') {
        return m.parse::<u64>().ok().map(|n| Duration::from_secs(n * 60));
    }
    let secs = v.strip_suffix('s').unwrap_or(v);
    secs.parse().ok().map(Duration::from_secs)
}

fn comment(i: &str) -> IResult<&str, ()> {
    let (i, _) = preceded(char('#'), opt(is_not("\n"))).parse(i)?;
    Ok((i, ()))
}

fn skip(i: &str) -> IResult<&str, ()> {
    let (i, _) = multispace0(i)?;
    let (i, _) = many0(terminated(comment, multispace0)).parse(i)?;
    Ok((i, ()))
}

fn token(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != ';' && c != '#').parse(i)
}

fn quoted(i: &str) -> IResult<&str, &str> {
    delimited(char('"'), is_not("\""), char('"')).parse(i)
}

fn directive(i: &str) -> IResult<&str, Directive> {
    let (i, _) = skip(i)?;
    let (i, name) = token(i)?;
    let (i, args) = many0(preceded(multispace0, alt((quoted, token)))).parse(i)?;
    let (i, _) = multispace0(i)?;
    let (i, _) = char(';').parse(i)?;
    Ok((i, Directive {
        name: name.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
    }))
}

/// Parse a whole directive source.
///
/// # Errors
///
/// Returns [`ConfigError::Syntax`] with the offending tail when the source
/// does not parse to completion.
pub fn parse_directives(src: &str) -> Result<Vec<Directive>, ConfigError> {
    let mut parser = many0(directive);
    let (rest, directives) = parser
        .parse(src)
        .map_err(|_| ConfigError::Syntax(snippet(src)))?;
    let (rest, _) = skip(rest).map_err(|_| ConfigError::Syntax(snippet(rest)))?;
    if !rest.trim().is_empty() {
        return Err(ConfigError::Syntax(snippet(rest)));
    }
    Ok(directives)
}

fn snippet(s: &str) -> String {
    s.trim_start().chars().take(32).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case("16k", Some(16 * 1024); "kilobytes")]
    #[test_case("1m", Some(1024 * 1024); "megabytes")]
    #[test_case("4096", Some(4096); "plain")]
    #[test_case("x", None; "garbage")]
    fn test_parse_size(input: &str, expected: Option<u64>) {
        assert_eq!(parse_size(input), expected);
    }

    #[test_case("50ms", Some(Duration::from_millis(50)); "millis")]
    #[test_case("60s", Some(Duration::from_secs(60)); "seconds")]
    #[test_case("5m", Some(Duration::from_secs(300)); "minutes")]
    #[test_case("7", Some(Duration::from_secs(7)); "plain seconds")]
    fn test_parse_duration(input: &str, expected: Option<Duration>) {
        assert_eq!(parse_duration(input), expected);
    }

    #[test]
    fn test_parse_directives() {
        let src = r#"
            # workers
            worker_processes 4;
            listen 127.0.0.1:9000;
            client_max_body_size 10; # inline comment
        "#;
        let ds = parse_directives(src).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds[0], Directive {
            name: "worker_processes".into(),
            args: vec!["4".into()],
        });
    }

    #[test]
    fn test_missing_semicolon_is_a_syntax_error() {
        assert!(matches!(
            parse_directives("worker_processes 4"),
            Err(ConfigError::Syntax(_))
        ));
    }

    #[test]
    fn test_config_from_sources() {
        let file = "worker_processes 2; listen 127.0.0.1:9000; accept_mutex off;";
        let inline = "worker_processes 8;";
        let cfg = Config::from_sources(PathBuf::from("/tmp"), Some(file), Some(inline)).unwrap();

        // Inline -g directives are applied last, so they win.
        assert_eq!(cfg.worker_processes, 8);
        assert_eq!(cfg.listen, vec!["127.0.0.1:9000".parse().unwrap()]);
        assert!(!cfg.accept_mutex);
    }

    #[test]
    fn test_default_listen_is_added() {
        let cfg = Config::from_sources(PathBuf::from("."), None, None).unwrap();
        assert_eq!(cfg.listen, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn test_unknown_directive_is_rejected() {
        assert!(matches!(
            Config::from_sources(PathBuf::from("."), Some("no_such_thing on;"), None),
            Err(ConfigError::UnknownDirective(_))
        ));
    }
}
