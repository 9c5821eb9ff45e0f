use clap::error::ErrorKind;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::environment::Environment;
use crate::results::OutputMode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// `-h` was given; carries the rendered help text.
    #[error("{0}")]
    Help(String),
    #[error("{0}")]
    Invalid(String),
    #[error("invalid option pattern \"{0}\" (expected one letter, optionally followed by ':')")]
    InvalidPattern(&'static str),
    #[error("option -{0} is declared more than once")]
    DuplicateOption(char),
    #[error("argument for -{letter} must be a non-negative number, got \"{value}\"")]
    BadValue { letter: char, value: String },
    #[error("invalid argument for -{letter}: {message}")]
    Validation { letter: char, message: String },
}

/// A test-specific switch.
///
/// `pattern` is one ASCII letter or digit, followed by `:` when the switch
/// takes an argument, as in `getopt`.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub pattern: &'static str,
    pub help: &'static str,
    pub validate: Option<fn(&str) -> Result<(), String>>,
}

impl OptionSpec {
    pub const fn new(pattern: &'static str, help: &'static str) -> Self {
        Self {
            pattern,
            help,
            validate: None,
        }
    }

    /// Checks the switch's argument before a [`Config`] is produced.
    pub const fn validator(self, validate: fn(&str) -> Result<(), String>) -> Self {
        Self {
            validate: Some(validate),
            ..self
        }
    }

    pub fn letter(&self) -> Option<char> {
        self.pattern.chars().next()
    }

    pub fn takes_arg(&self) -> bool {
        self.pattern.ends_with(':')
    }

    fn check(&self) -> Result<char, ParseError> {
        let mut chars = self.pattern.chars();
        let letter = chars
            .next()
            .filter(char::is_ascii_alphanumeric)
            .ok_or(ParseError::InvalidPattern(self.pattern))?;
        match chars.as_str() {
            "" | ":" => Ok(letter),
            _ => Err(ParseError::InvalidPattern(self.pattern)),
        }
    }
}

/// The standard switches every test understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Standard {
    Copies,
    Iterations,
    Duration,
    Pause,
    Delay,
    Errno,
    Timing,
    NoFunctional,
    Help,
}

impl Standard {
    const ALL: [Standard; 9] = [
        Self::Copies,
        Self::Iterations,
        Self::Duration,
        Self::Pause,
        Self::Delay,
        Self::Errno,
        Self::Timing,
        Self::NoFunctional,
        Self::Help,
    ];

    fn letter(self) -> char {
        match self {
            Self::Copies => 'c',
            Self::Iterations => 'i',
            Self::Duration => 'I',
            Self::Pause => 'p',
            Self::Delay => 'P',
            Self::Errno => 'e',
            Self::Timing => 't',
            Self::NoFunctional => 'f',
            Self::Help => 'h',
        }
    }

    fn id(self) -> &'static str {
        match self {
            Self::Copies => "copies",
            Self::Iterations => "iterations",
            Self::Duration => "duration",
            Self::Pause => "pause",
            Self::Delay => "delay",
            Self::Errno => "errno",
            Self::Timing => "timing",
            Self::NoFunctional => "no-functional",
            Self::Help => "help",
        }
    }

    fn arg(self) -> Arg {
        let arg = Arg::new(self.id()).short(self.letter());
        match self {
            Self::Copies => arg
                .value_name("N")
                .value_parser(value_parser!(u32).range(1..))
                .help("Run N copies concurrently"),
            Self::Iterations => arg
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Execute the test N times"),
            Self::Duration => arg
                .value_name("SECS")
                .allow_negative_numbers(true)
                .help("Execute the test for SECS seconds (overrides -i)"),
            Self::Pause => arg
                .action(ArgAction::SetTrue)
                .help("Pause for SIGUSR1 before starting"),
            Self::Delay => arg
                .value_name("SECS")
                .allow_negative_numbers(true)
                .help("Pause SECS seconds between iterations"),
            Self::Errno => arg
                .action(ArgAction::SetTrue)
                .help("Turn on errno logging"),
            Self::Timing => arg
                .action(ArgAction::SetTrue)
                .help("Turn on syscall timing"),
            Self::NoFunctional => arg
                .action(ArgAction::SetTrue)
                .help("Turn off functional testing"),
            Self::Help => arg.action(ArgAction::Help).help("Show this help screen"),
        }
    }
}

/// Parsed run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub copies: u32,
    pub iterations: u32,
    pub duration: Option<Duration>,
    pub pause: bool,
    pub delay: Option<Duration>,
    pub errno_logging: bool,
    pub timing: bool,
    /// Cleared by `-f`: check only that calls succeed, not their effects.
    pub functional: bool,
    pub output: OutputMode,
    pub operands: Vec<String>,
    pub(crate) options: BTreeMap<char, Option<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            copies: 1,
            iterations: 1,
            duration: None,
            pause: false,
            delay: None,
            errno_logging: false,
            timing: false,
            functional: true,
            output: OutputMode::default(),
            operands: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Whether the test-specific switch `letter` was given.
    pub fn flag(&self, letter: char) -> bool {
        self.options.contains_key(&letter)
    }

    /// Argument of the test-specific switch `letter`, if given.
    pub fn arg(&self, letter: char) -> Option<&str> {
        self.options.get(&letter).and_then(|v| v.as_deref())
    }
}

/// Parses the standard switches merged with a test's own option table.
///
/// A test option whose letter matches a standard switch turns that switch
/// off: it is then recognized neither as standard nor as the test's own.
/// Settings missing from the command line fall back to `USC_*` variables
/// in the environment.
#[derive(Debug, Clone)]
pub struct ConfigParser<'a> {
    name: &'static str,
    options: &'a [OptionSpec],
    env: Environment,
}

impl<'a> ConfigParser<'a> {
    pub fn new(name: &'static str, options: &'a [OptionSpec]) -> Self {
        Self {
            name,
            options,
            env: Environment::from_process(),
        }
    }

    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Parses `args`, whose first element is the program name.
    ///
    /// # Returns
    /// * `Result<Config, ParseError>` - The configuration, or a description
    ///   of what was wrong. Nothing partial is returned on error.
    pub fn parse<I, T>(&self, args: I) -> Result<Config, ParseError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let (command, enabled, own) = self.command()?;
        let matches = command.try_get_matches_from(args).map_err(|e| match e.kind() {
            ErrorKind::DisplayHelp => ParseError::Help(e.render().to_string()),
            _ => ParseError::Invalid(first_line(&e.render().to_string())),
        })?;

        let mut config = Config::default();
        let given = |s: Standard| enabled.contains(&s) && matches.contains_id(s.id());

        if given(Standard::Copies) {
            config.copies = matches.get_one::<u32>(Standard::Copies.id()).copied().unwrap_or(1);
        } else if let Some(copies) = self.env.parse::<u32>("USC_COPIES").filter(|c| *c > 0) {
            config.copies = copies;
        }

        if given(Standard::Iterations) {
            config.iterations = matches
                .get_one::<u32>(Standard::Iterations.id())
                .copied()
                .unwrap_or(1);
        } else if let Some(iterations) = self.env.parse::<u32>("USC_ITERATIONS") {
            config.iterations = iterations;
        }

        config.duration = if given(Standard::Duration) {
            seconds_arg(&matches, Standard::Duration)?
        } else {
            self.env_seconds("USC_LOOP_WALLTIME")
                .or_else(|| self.env_seconds("USC_DURATION"))
        };

        config.delay = if given(Standard::Delay) {
            seconds_arg(&matches, Standard::Delay)?
        } else {
            self.env_seconds("USC_LOOP_DELAY")
        };

        config.pause = enabled.contains(&Standard::Pause) && matches.get_flag(Standard::Pause.id());
        config.errno_logging =
            enabled.contains(&Standard::Errno) && matches.get_flag(Standard::Errno.id());
        config.timing = enabled.contains(&Standard::Timing) && matches.get_flag(Standard::Timing.id());
        let no_functional = enabled.contains(&Standard::NoFunctional)
            && matches.get_flag(Standard::NoFunctional.id());
        config.functional = !(no_functional || self.env.contains("USC_NO_FUNC_CHECK"));

        for spec in own {
            let letter = spec.check()?;
            if spec.takes_arg() {
                if let Some(value) = matches.get_one::<String>(spec.pattern) {
                    if let Some(validate) = spec.validate {
                        validate(value)
                            .map_err(|message| ParseError::Validation { letter, message })?;
                    }
                    config.options.insert(letter, Some(value.clone()));
                }
            } else if matches.get_flag(spec.pattern) {
                config.options.insert(letter, None);
            }
        }

        config.operands = matches
            .get_many::<String>("operands")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default();
        config.output = OutputMode::from_setting(self.env.get("TOUTPUT"));

        debug!(?config, "parsed options");
        Ok(config)
    }

    /// Help screen listing standard and test-specific switches.
    pub fn help(&self) -> Result<String, ParseError> {
        let (mut command, _, _) = self.command()?;
        Ok(command.render_help().to_string())
    }

    /// Builds the clap command, returning which standard switches survive
    /// and which test options are active.
    fn command(&self) -> Result<(Command, Vec<Standard>, Vec<&'a OptionSpec>), ParseError> {
        let mut letters: Vec<char> = Vec::with_capacity(self.options.len());
        for spec in self.options {
            let letter = spec.check()?;
            if letters.contains(&letter) {
                return Err(ParseError::DuplicateOption(letter));
            }
            letters.push(letter);
        }

        let enabled: Vec<Standard> = Standard::ALL
            .into_iter()
            .filter(|s| !letters.contains(&s.letter()))
            .collect();
        let own: Vec<&'a OptionSpec> = self
            .options
            .iter()
            .filter(|spec| {
                spec.letter()
                    .is_some_and(|l| !Standard::ALL.iter().any(|s| s.letter() == l))
            })
            .collect();
        for disabled in Standard::ALL.iter().filter(|s| !enabled.contains(s)) {
            debug!("standard option -{} disabled by test", disabled.letter());
        }

        let mut command = Command::new(self.name)
            .disable_help_flag(true)
            .disable_version_flag(true)
            .args_override_self(true);
        for standard in &enabled {
            command = command.arg(standard.arg());
        }
        for spec in &own {
            let letter = spec.check()?;
            let arg = Arg::new(spec.pattern).short(letter).help(spec.help);
            command = command.arg(if spec.takes_arg() {
                arg.value_name("ARG").action(ArgAction::Set)
            } else {
                arg.action(ArgAction::SetTrue)
            });
        }
        command = command.arg(
            Arg::new("operands")
                .value_name("OPERANDS")
                .num_args(0..)
                .action(ArgAction::Append),
        );

        Ok((command, enabled, own))
    }

    fn env_seconds(&self, key: &str) -> Option<Duration> {
        self.env
            .parse::<f64>(key)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

fn seconds_arg(matches: &ArgMatches, standard: Standard) -> Result<Option<Duration>, ParseError> {
    let Some(raw) = matches.get_one::<String>(standard.id()) else {
        return Ok(None);
    };
    let bad = || ParseError::BadValue {
        letter: standard.letter(),
        value: raw.clone(),
    };
    let secs: f64 = raw.trim().parse().map_err(|_| bad())?;
    Duration::try_from_secs_f64(secs).map(Some).map_err(|_| bad())
}

fn first_line(rendered: &str) -> String {
    rendered
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error: ")
        .to_string()
}
