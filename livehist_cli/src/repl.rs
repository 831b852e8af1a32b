use ndarray::Dimension;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use liblivehist::engine::Engine;
use liblivehist::error::{AttachError, EngineError, HistogramError};
use liblivehist::event::EventCode;
use liblivehist::histogram::{Axis, HistogramKind, HistogramSnapshot, HistogramSpec, Orientation};

pub const HELP: &str = "\
attach file <path> [continuous]   attach to a framed file
attach list <path>                attach to a list of framed files
attach online <host> <port>       attach to a TCP source
unattach | state
event <code>                      select the event type for new histograms
new1 <name> <param> <n> <lo> <hi> [gate]
new2 <name> <x:y> <n> <lo> <hi> <n> <lo> <hi> [gate]
new3 <name> <x:y:z> <n> <lo> <hi> (x3) [gate]
summary <name> <p;q;r[0-3]> <n> <lo> <hi> <v|h> [gate]
gamma <name> <group:group> (<n> <lo> <hi> per group) [gate]
bits <name> <param> <nbits> [gate]
scaler <name> <param> <bins> [gate]
regate <name> [gate] | fill <name> | clear <name|all> | delete <name|all>
list | show <name> | vars | get <path> | set <path> <value>
help | quit";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command \"{0}\", try help")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Could not parse \"{0}\" as a number")]
    BadNumber(String),
    #[error("No histogram named {0}")]
    NoHistogram(String),
    #[error("Command failed due to engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Command failed due to attach error: {0}")]
    Attach(#[from] AttachError),
    #[error("Command failed due to histogram error: {0}")]
    Histogram(#[from] HistogramError),
}

#[derive(Debug)]
pub enum Command {
    AttachFile { path: PathBuf, continuous: bool },
    AttachList(PathBuf),
    AttachOnline { host: String, port: String },
    Unattach,
    State,
    Event(EventCode),
    New(HistogramSpec),
    Regate { name: String, gate: String },
    Fill(String),
    Clear(Option<String>),
    Delete(Option<String>),
    List,
    Show(String),
    Vars,
    Get(String),
    Set { path: String, value: f64 },
    Help,
    Quit,
}

fn number<T: FromStr>(token: &str) -> Result<T, CommandError> {
    token
        .parse::<T>()
        .map_err(|_| CommandError::BadNumber(token.to_string()))
}

/// Read `count` axes from consecutive `<n> <lo> <hi>` triples
fn axes(tokens: &[&str], count: usize, usage: &'static str) -> Result<Vec<Axis>, CommandError> {
    if tokens.len() < 3 * count {
        return Err(CommandError::Usage(usage));
    }
    tokens
        .chunks(3)
        .take(count)
        .map(|triple| -> Result<Axis, CommandError> {
            Ok(Axis::new(
                number(triple[0])?,
                number(triple[1])?,
                number(triple[2])?,
            )?)
        })
        .collect()
}

fn name_or_all(token: Option<&&str>) -> Option<String> {
    token.filter(|t| **t != "all").map(|t| t.to_string())
}

/// Parse one input line. Blank lines and `#` comments give `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (keyword, args) = match tokens.split_first() {
        Some((keyword, _)) if keyword.starts_with('#') => return Ok(None),
        Some((keyword, args)) => (*keyword, args),
        None => return Ok(None),
    };
    let gate_from = |start: usize| args.get(start..).unwrap_or_default().join(" ");

    let command = match (keyword, args) {
        ("attach", ["file", path]) => Command::AttachFile {
            path: PathBuf::from(path),
            continuous: false,
        },
        ("attach", ["file", path, "continuous"]) => Command::AttachFile {
            path: PathBuf::from(path),
            continuous: true,
        },
        ("attach", ["list", path]) => Command::AttachList(PathBuf::from(path)),
        ("attach", ["online", host, port]) => Command::AttachOnline {
            host: host.to_string(),
            port: port.to_string(),
        },
        ("attach", _) => {
            return Err(CommandError::Usage(
                "attach file <path> [continuous] | attach list <path> | attach online <host> <port>",
            ))
        }
        ("unattach", _) => Command::Unattach,
        ("state", _) => Command::State,
        ("event", [code]) => Command::Event(number(code)?),
        ("new1", [name, param, rest @ ..]) => {
            let usage = "new1 <name> <param> <n> <lo> <hi> [gate]";
            let axes = axes(rest, 1, usage)?;
            Command::New(HistogramSpec::d1(name, param, &gate_from(5), axes[0]))
        }
        ("new2", [name, params, rest @ ..]) => {
            let usage = "new2 <name> <x:y> <n> <lo> <hi> <n> <lo> <hi> [gate]";
            let axes = axes(rest, 2, usage)?;
            Command::New(HistogramSpec::d2(name, params, &gate_from(8), axes[0], axes[1]))
        }
        ("new3", [name, params, rest @ ..]) => {
            let usage = "new3 <name> <x:y:z> <n> <lo> <hi> (x3) [gate]";
            let axes = axes(rest, 3, usage)?;
            Command::New(HistogramSpec::d3(
                name,
                params,
                &gate_from(11),
                axes[0],
                axes[1],
                axes[2],
            ))
        }
        ("summary", [name, params, nbins, low, high, flag, ..]) => {
            let values = Axis::new(number(nbins)?, number(low)?, number(high)?)?;
            Command::New(HistogramSpec::summary(
                name,
                params,
                &gate_from(6),
                values,
                Orientation::from_flag(flag),
            ))
        }
        ("gamma", [name, groups, rest @ ..]) => {
            let usage = "gamma <name> <group:group> (<n> <lo> <hi> per group) [gate]";
            let count = groups.split(':').count();
            let axes = axes(rest, count, usage)?;
            Command::New(HistogramSpec::gamma(
                name,
                groups,
                &gate_from(2 + 3 * count),
                axes,
            ))
        }
        ("bits", [name, param, nbits, ..]) => Command::New(HistogramSpec::bitmask(
            name,
            param,
            &gate_from(3),
            number(nbits)?,
        )),
        ("scaler", [name, param, bins, ..]) => Command::New(HistogramSpec::scaler(
            name,
            param,
            &gate_from(3),
            number(bins)?,
        )),
        ("regate", [name, ..]) => Command::Regate {
            name: name.to_string(),
            gate: gate_from(1),
        },
        ("fill", [name]) => Command::Fill(name.to_string()),
        ("clear", [..]) => Command::Clear(name_or_all(args.first())),
        ("delete", [_, ..]) => Command::Delete(name_or_all(args.first())),
        ("list", _) => Command::List,
        ("show", [name]) => Command::Show(name.to_string()),
        ("vars", _) => Command::Vars,
        ("get", [path]) => Command::Get(path.to_string()),
        ("set", [path, value]) => Command::Set {
            path: path.to_string(),
            value: number(value)?,
        },
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        ("new1" | "new2" | "new3" | "summary" | "gamma" | "bits" | "scaler", _)
        | ("event" | "regate" | "fill" | "delete" | "show" | "get" | "set", _) => {
            return Err(CommandError::Usage(
                "see help for the arguments of this command",
            ))
        }
        (other, _) => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn describe_kind(kind: &HistogramKind) -> String {
    match kind {
        HistogramKind::Standard => String::from("standard"),
        HistogramKind::Summary { orientation } => format!("summary ({orientation:?})"),
        HistogramKind::Gamma => String::from("gamma"),
        HistogramKind::Bitmask { nbits } => format!("bitmask ({nbits} bits)"),
        HistogramKind::Scaler => String::from("scaler"),
    }
}

fn print_snapshot(snapshot: &HistogramSnapshot) {
    println!("{} [{}]", snapshot.name, describe_kind(&snapshot.kind));
    println!("  title:   {}", snapshot.title);
    println!("  params:  {}", snapshot.params.join(" : "));
    println!("  gate:    {}", snapshot.gate);
    println!("  entries: {}", snapshot.entries);
    for (index, content) in snapshot.bins.indexed_iter() {
        if *content == 0.0 {
            continue;
        }
        match (snapshot.kind == HistogramKind::Scaler, snapshot.axes.first()) {
            (false, Some(axis)) if snapshot.dimension() == 1 => {
                let low = axis.low + (index[0] as f64 - 1.0) * axis.bin_width();
                println!("  [{low:>10.3}, {:>10.3}) {content}", low + axis.bin_width());
            }
            _ => println!("  {:?} {content}", index.slice()),
        }
    }
}

/// One interactive session over an engine
pub struct Session<'a> {
    engine: &'a Engine,
    event: EventCode,
}

impl<'a> Session<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        let event = engine
            .events()
            .first()
            .map(|(code, _)| *code)
            .unwrap_or_default();
        Self { engine, event }
    }

    fn find(&self, name: &str) -> Result<liblivehist::histogram::HistogramId, CommandError> {
        self.engine
            .find_by_name(name)
            .ok_or_else(|| CommandError::NoHistogram(name.to_string()))
    }

    /// Run a command. Returns false once the session should end.
    pub fn execute(&mut self, command: Command) -> Result<bool, CommandError> {
        match command {
            Command::AttachFile { path, continuous } => {
                self.engine.attach_file(&path, !continuous)?
            }
            Command::AttachList(path) => self.engine.attach_list(&path)?,
            Command::AttachOnline { host, port } => {
                self.engine.attach_online(&host, &port, &[])?
            }
            Command::Unattach => self.engine.unattach(),
            Command::State => println!("{:?}", self.engine.attachment_state()),
            Command::Event(code) => {
                if !self.engine.events().iter().any(|(c, _)| *c == code) {
                    return Err(EngineError::UnknownEvent(code).into());
                }
                self.event = code;
            }
            Command::New(spec) => {
                let id = self.engine.new_histogram(self.event, &spec)?;
                let snapshot = self.engine.snapshot(id)?;
                println!("Created {} ({id})", snapshot.name);
            }
            Command::Regate { name, gate } => self.engine.regate(self.find(&name)?, &gate)?,
            Command::Fill(name) => {
                let filled = self.engine.fill(self.find(&name)?)?;
                println!("{filled} bin(s) incremented");
            }
            Command::Clear(Some(name)) => self.engine.clear(self.find(&name)?)?,
            Command::Clear(None) => self.engine.clear_all(),
            Command::Delete(Some(name)) => self.engine.delete(self.find(&name)?)?,
            Command::Delete(None) => self.engine.delete_all(),
            Command::List => {
                for snapshot in self.engine.histograms() {
                    println!(
                        "{:>8} {:<20} {:<16} {:>10} {}",
                        snapshot.id.to_string(),
                        snapshot.name,
                        describe_kind(&snapshot.kind),
                        snapshot.entries,
                        snapshot.title
                    );
                }
            }
            Command::Show(name) => print_snapshot(&self.engine.snapshot(self.find(&name)?)?),
            Command::Vars => {
                for (code, name) in self.engine.events() {
                    let stats = self.engine.event_stats(code)?;
                    println!(
                        "event {code} ({name}): {} processed, {} bad",
                        stats.processed, stats.bad
                    );
                    for path in self.engine.variables(code)? {
                        println!("  {path}");
                    }
                }
            }
            Command::Get(path) => {
                println!("{}", self.engine.read_variable(self.event, &path)?)
            }
            Command::Set { path, value } => self.engine.set_variable(self.event, &path, value)?,
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}
