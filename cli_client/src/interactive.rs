//! Menu driven front end.
//!
//! The menu only collects answers and turns them into the same [`Command`]
//! the argument parser produces; running it is left to the caller. End of
//! input at any prompt leaves the menu without a command.

use relay_core::AppConfig;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use crate::cli::{Command, ConfigArgs, MeshArgs, MeshCommand, QuickArgs, ServerArgs};

const DEFAULT_BLOCK: &str = "10.99.0.0/24";
const DEFAULT_KEY: &str = "~/.ssh/id_rsa";

/// Line oriented prompts over any reader and writer.
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Prompter { input, output }
    }

    pub fn say(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.output, "{line}")
    }

    /// Trimmed answer, `None` at end of input.
    pub fn ask(&mut self, prompt: &str) -> io::Result<Option<String>> {
        write!(self.output, "{prompt}: ")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    /// Asks until the answer is not empty.
    pub fn ask_required(&mut self, prompt: &str) -> io::Result<Option<String>> {
        loop {
            match self.ask(prompt)? {
                Some(answer) if answer.is_empty() => self.say("A value is required.")?,
                other => return Ok(other),
            }
        }
    }

    /// An empty answer takes `default`.
    pub fn ask_default(&mut self, prompt: &str, default: &str) -> io::Result<Option<String>> {
        Ok(self
            .ask(&format!("{prompt} [{default}]"))?
            .map(|answer| if answer.is_empty() { default.to_string() } else { answer }))
    }

    /// An empty answer gives `None` inside the outer option.
    pub fn ask_optional(&mut self, prompt: &str) -> io::Result<Option<Option<String>>> {
        Ok(self
            .ask(prompt)?
            .map(|answer| Some(answer).filter(|a| !a.is_empty())))
    }

    pub fn ask_port(&mut self, prompt: &str, default: u16) -> io::Result<Option<u16>> {
        loop {
            let Some(answer) = self.ask_default(prompt, &default.to_string())? else {
                return Ok(None);
            };
            match answer.parse::<u16>() {
                Ok(port) if port != 0 => return Ok(Some(port)),
                _ => self.say("Please enter a port between 1 and 65535.")?,
            }
        }
    }

    pub fn confirm(&mut self, prompt: &str, default: bool) -> io::Result<Option<bool>> {
        let hint = if default { "Y/n" } else { "y/N" };
        loop {
            let Some(answer) = self.ask(&format!("{prompt} [{hint}]"))? else {
                return Ok(None);
            };
            match answer.to_ascii_lowercase().as_str() {
                "" => return Ok(Some(default)),
                "y" | "yes" => return Ok(Some(true)),
                "n" | "no" => return Ok(Some(false)),
                _ => self.say("Please answer y or n.")?,
            }
        }
    }

    /// Numbered menu; returns the zero based index of the chosen option.
    pub fn choose(&mut self, title: &str, options: &[&str]) -> io::Result<Option<usize>> {
        self.say("")?;
        self.say(title)?;
        for (i, option) in options.iter().enumerate() {
            self.say(&format!("  {}. {option}", i + 1))?;
        }
        loop {
            let Some(answer) = self.ask("Choice")? else {
                return Ok(None);
            };
            match answer.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(Some(n - 1)),
                _ => self.say(&format!(
                    "Please enter a number between 1 and {}.",
                    options.len()
                ))?,
            }
        }
    }
}

/// Runs the menu on the terminal.
pub fn run_stdio() -> io::Result<Option<Command>> {
    let stdin = io::stdin();
    let mut prompter = Prompter::new(stdin.lock(), io::stdout());
    main_menu(&mut prompter)
}

// Unwraps an answer or leaves the menu at end of input.
macro_rules! answer {
    ($e:expr) => {
        match $e? {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

pub fn main_menu<R: BufRead, W: Write>(p: &mut Prompter<R, W>) -> io::Result<Option<Command>> {
    p.say("meshrelay")?;
    loop {
        let choice = answer!(p.choose(
            "What would you like to do?",
            &[
                "Quick setup (discover a server)",
                "Mesh network",
                "Use an existing configuration",
                "Start the management API",
                "Exit",
            ],
        ));

        let command = match choice {
            0 => quick_setup(p)?,
            1 => match mesh_menu(p)? {
                MeshChoice::Command(command) => Some(command),
                MeshChoice::Back => continue,
                MeshChoice::Eof => None,
            },
            2 => existing_config(p)?,
            3 => {
                let port = answer!(p.ask_optional("API port (empty for the configured one)"));
                match port.map(|s| s.parse::<u16>()) {
                    Some(Err(_)) => {
                        p.say("Not a port number.")?;
                        continue;
                    }
                    port => Some(Command::Server(ServerArgs {
                        port: port.and_then(Result::ok),
                        host: None,
                        config: None,
                    })),
                }
            }
            _ => None,
        };
        return Ok(command);
    }
}

fn quick_setup<R: BufRead, W: Write>(p: &mut Prompter<R, W>) -> io::Result<Option<Command>> {
    let host = answer!(p.ask_required("Server address"));
    let user = answer!(p.ask_default("SSH user", "root"));
    let port = answer!(p.ask_port("SSH port", 22));

    let method = answer!(p.choose("Authentication", &["Password", "SSH key"]));
    let (auth, key) = if method == 0 {
        (Some(answer!(p.ask_required("Password"))), None)
    } else {
        (None, Some(PathBuf::from(answer!(p.ask_default("Private key", DEFAULT_KEY)))))
    };

    let setup = answer!(p.confirm("Install missing protocols on the server", false));
    let output_dir = answer!(p.ask_default("Output directory", "client-configs"));
    let connect = answer!(p.confirm("Connect when done", true));

    Ok(Some(Command::Quick(QuickArgs {
        host,
        user,
        auth,
        key,
        port,
        setup,
        output_dir: PathBuf::from(output_dir),
        connect,
    })))
}

enum MeshChoice {
    Command(Command),
    Back,
    Eof,
}

fn mesh_menu<R: BufRead, W: Write>(p: &mut Prompter<R, W>) -> io::Result<MeshChoice> {
    // Inner helper so `answer!` can bail out with Ok(None)
    fn pick<R: BufRead, W: Write>(
        p: &mut Prompter<R, W>,
    ) -> io::Result<Option<Option<MeshCommand>>> {
        let choice = answer!(p.choose(
            "Mesh network",
            &[
                "Initialize a mesh",
                "Add a server",
                "Show status",
                "Connect to a node",
                "Remove a node",
                "Back",
            ],
        ));

        let action = match choice {
            0 => MeshCommand::Init {
                block: Some(answer!(p.ask_default("Address block", DEFAULT_BLOCK))),
            },
            1 => MeshCommand::Add {
                host: answer!(p.ask_required("Server address")),
                user: answer!(p.ask_default("SSH user", "root")),
                password: answer!(p.ask_optional("Password (empty for key login)")),
                port: answer!(p.ask_port("SSH port", 22)),
                name: None,
                tags: answer!(p.ask("Tags, comma separated"))
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
                region: answer!(p.ask_optional("Region")),
            },
            2 => MeshCommand::Status {
                check: true,
                json: false,
            },
            3 => {
                let how = answer!(p.choose("Pick a node", &["Best node", "By region", "By tag"]));
                match how {
                    0 => MeshCommand::Connect {
                        node: None,
                        region: None,
                        tag: None,
                    },
                    1 => MeshCommand::Connect {
                        node: None,
                        region: Some(answer!(p.ask_required("Region"))),
                        tag: None,
                    },
                    _ => MeshCommand::Connect {
                        node: None,
                        region: None,
                        tag: Some(answer!(p.ask_required("Tag"))),
                    },
                }
            }
            4 => MeshCommand::Remove {
                node: answer!(p.ask_required("Node id")),
            },
            _ => return Ok(Some(None)),
        };
        Ok(Some(Some(action)))
    }

    Ok(match pick(p)? {
        Some(Some(action)) => MeshChoice::Command(Command::Mesh(MeshArgs {
            state: None,
            config: None,
            action,
        })),
        Some(None) => MeshChoice::Back,
        None => MeshChoice::Eof,
    })
}

fn existing_config<R: BufRead, W: Write>(p: &mut Prompter<R, W>) -> io::Result<Option<Command>> {
    let default_path = AppConfig::default_path().display().to_string();
    let path = PathBuf::from(answer!(p.ask_default("Configuration file", &default_path)));

    let mode = answer!(p.choose(
        "Run mode",
        &["Client mode", "Server mode (management API)"],
    ));
    let (server, port) = if mode == 1 {
        (true, Some(answer!(p.ask_port("API port", 8888))))
    } else {
        (false, None)
    };

    Ok(Some(Command::Config(ConfigArgs {
        path,
        server,
        port,
        tunnel: None,
    })))
}
