use std::{
    borrow::Cow,
    collections::HashMap,
    env,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use tracing_core::LevelFilter;

/// CLI argument that is responsible for holding application configuration
/// file path.
static APP_CONF_PATH_CMD_ARG_NAME: &str = "--conf";

/// Environment variable that is responsible for holding application
/// configuration file path.
static APP_CONF_PATH_ENV_VAR_NAME: &str = "TURN_RELAY__CONF";

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Conf {
    /// Logging settings.
    pub log: Log,

    /// [STUN] server settings.
    ///
    /// [STUN]: https://webrtcglossary.com/stun
    pub stun: Stun,

    /// [TURN] relay settings.
    ///
    /// [TURN]: https://webrtcglossary.com/turn
    pub turn: Turn,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, SmartDefault)]
#[serde(default)]
pub struct Stun {
    /// IP that STUN UDP socket will bind to.
    ///
    /// Defaults to `0.0.0.0`.
    #[default(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub bind_ip: IpAddr,

    /// Port that STUN UDP will use.
    ///
    /// Defaults to `3478`.
    #[default = 3478]
    pub bind_port: u16,

    /// Whether to also accept clients over TCP on the same port.
    ///
    /// Defaults to `true`.
    #[default = true]
    pub tcp: bool,

    /// Whether TCP clients wrap STUN messages into the legacy 4-byte
    /// channel-0 framing.
    ///
    /// Defaults to `false`.
    pub legacy_framing: bool,

    /// Alternate IP answering RFC 3489 `CHANGE-REQUEST`s along with
    /// `alternate_port`, if any.
    pub alternate_ip: Option<IpAddr>,

    /// Alternate port answering RFC 3489 `CHANGE-REQUEST`s.
    ///
    /// Defaults to `3479`.
    #[default = 3479]
    pub alternate_port: u16,
}

/// Credentials mechanism required from clients.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// No credentials.
    None,

    /// Short-term credentials issued by the server.
    ShortTerm,

    /// Long-term credentials of the configured `users`.
    #[default]
    LongTerm,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, SmartDefault)]
#[serde(default)]
pub struct Turn {
    /// Realm of the server.
    ///
    /// Defaults to `turn-relay`.
    #[default("turn-relay".into())]
    pub realm: String,

    /// Credentials mechanism required from clients.
    ///
    /// Defaults to `long-term`.
    pub auth: AuthMode,

    /// Passwords of long-term users by their usernames.
    pub users: HashMap<String, String>,

    /// IP reported to clients as the relayed address.
    ///
    /// Defaults to `stun.bind_ip`.
    pub relay_ip: Option<IpAddr>,

    /// Minimum relay port.
    ///
    /// Defaults to `49152`.
    #[default = 49152]
    pub min_port: u16,

    /// Maximum relay port.
    ///
    /// Defaults to `65535`.
    #[default = 65535]
    pub max_port: u16,

    /// Lifetime of allocations not requesting one, in seconds.
    ///
    /// Defaults to `600`.
    #[default = 600]
    pub default_lifetime: u64,

    /// Maximum lifetime of allocations, in seconds.
    ///
    /// Defaults to `3600`.
    #[default = 3600]
    pub max_lifetime: u64,

    /// Lifetime of issued nonces, in seconds, `0` meaning they never expire.
    ///
    /// Defaults to `0`.
    pub nonce_lifetime: u64,

    /// Whether peers' data is sent as `ChannelData` only after clients
    /// confirm their channel bindings.
    ///
    /// Defaults to `false`.
    pub require_channel_confirmation: bool,
}

impl Turn {
    /// Returns the configured nonce lifetime, if nonces expire.
    pub fn nonce_lifetime(&self) -> Option<Duration> {
        (self.nonce_lifetime > 0)
            .then(|| Duration::from_secs(self.nonce_lifetime))
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, SmartDefault)]
#[serde(default)]
pub struct Log {
    /// Maximum allowed level of application log entries.
    ///
    /// Defaults to `INFO`.
    #[default(LevelFilter::INFO)]
    #[serde(with = "level")]
    pub level: LevelFilter,

    /// Settings of application log for specific modules.
    ///
    /// Override any common settings declared above.
    pub r#mod: HashMap<String, Module>,
}

/// Log settings for a specific module.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Module {
    /// Maximum allowed level of the module log entries.
    #[serde(with = "level")]
    pub level: LevelFilter,
}

impl Conf {
    /// Parses a [`Conf`] from all possible sources and evaluates its values.
    ///
    /// The sources and their priority are following (descending):
    /// - default values;
    /// - configuration `file` (if present);
    /// - environment variables (if present).
    ///
    /// # Errors
    ///
    /// If a [`Conf`] fails to be parsed from the `file` or environment
    /// variables.
    pub fn parse() -> Result<Self, ConfigError> {
        let file = get_conf_file_name(env::args())
            .map_or(Cow::Borrowed("turn-relay.toml"), Cow::Owned);
        Config::builder()
            .add_source(File::with_name(file.as_ref()).required(false))
            .add_source(Environment::with_prefix("TURN_RELAY").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Custom [`serde`] implementation for a [`LevelFilter`].
pub(crate) mod level {
    use std::str::FromStr as _;

    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};
    use tracing_core::{Level, LevelFilter};

    /// Serializes a [`LevelFilter`] as `OFF`, `ERROR`, `WARN`, `INFO`,
    /// `DEBUG` or `TRACE` values.
    #[expect( // required by `serde`
        clippy::trivially_copy_pass_by_ref,
        reason = "required by `serde`"
    )]
    pub(crate) fn serialize<S: Serializer>(
        lvl: &LevelFilter,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(lvl.into_level().as_ref().map_or("OFF", Level::as_str))
    }

    /// Deserializes a [`LevelFilter`] from `OFF`, `ERROR`, `WARN`, `INFO`,
    /// `DEBUG` or `TRACE` values.
    pub(crate) fn deserialize<'de, D>(d: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        LevelFilter::from_str(&String::deserialize(d)?)
            .map_err(D::Error::custom)
    }
}

/// Looks up the configuration file path in the CLI `args` and the
/// environment.
fn get_conf_file_name<T>(args: T) -> Option<String>
where
    T: IntoIterator<Item = String>,
{
    // First, check CLI arguments as they have the highest priority.
    let mut args =
        args.into_iter().skip_while(|x| x != APP_CONF_PATH_CMD_ARG_NAME);
    if args.next().is_some() {
        return args.next().filter(|v| !v.is_empty());
    }

    // Then check env var.
    env::var(APP_CONF_PATH_ENV_VAR_NAME).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod conf_spec {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|&a| a.to_owned()).collect()
    }

    #[test]
    fn takes_conf_path_from_args() {
        assert_eq!(
            get_conf_file_name(args(&["bin", "--conf", "custom.toml"])),
            Some(String::from("custom.toml")),
        );
        assert_eq!(get_conf_file_name(args(&["bin", "--conf", ""])), None);
    }

    #[test]
    fn has_sane_defaults() {
        let conf = Conf::default();

        assert_eq!(conf.stun.bind_port, 3478);
        assert!(conf.stun.tcp, "TCP is enabled by default");
        assert_eq!(conf.turn.auth, AuthMode::LongTerm);
        assert_eq!(conf.turn.realm, "turn-relay");
        assert_eq!((conf.turn.min_port, conf.turn.max_port), (49152, 65535));
        assert_eq!(conf.turn.nonce_lifetime(), None);
    }
}
