use rustyline::{Editor, Helper, Config, error::ReadlineError, Context};
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use std::future::Future;

pub const COMMANDS: [&str; 4] = ["status", "port", "stop", "exit"];

/// A console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Port,
    Stop,
    Exit,
}

impl Command {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "status" => Some(Command::Status),
            "port" => Some(Command::Port),
            "stop" => Some(Command::Stop),
            "exit" | "quit" => Some(Command::Exit),
            _ => None,
        }
    }
}



/*
    @@@
    @CmdCompleter;
    . Plugs into rustyline to provide prefix-based tab-completion over COMMANDS.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, _pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(line))
            .map(|cmd| Pair { display: cmd.clone(), replacement: cmd.clone() })
            .collect();
        Ok((0, matches))
    }
}



/*
    @@@
    @run_shell();
    . Reads commands until `exit`, Ctrl-C or EOF, with completion and history kept in `history`.
    . `status` and `port` call on_status / on_port; `stop` calls on_stop and ends the console, since a stopped supervisor cannot be restarted.
    . Returns after the loop; stopping the backend on exit is the caller's job.
*/
pub async fn run_shell<SFut, PFut, StFut, OnStatus, OnPort, OnStop>(
    history: &str,
    mut on_status: OnStatus,
    mut on_port: OnPort,
    mut on_stop: OnStop,
) -> rustyline::Result<()>
where
    OnStatus: FnMut() -> SFut,
    SFut: Future<Output = ()>,
    OnPort: FnMut() -> PFut,
    PFut: Future<Output = ()>,
    OnStop: FnMut() -> StFut,
    StFut: Future<Output = ()>,
{
    let config = Config::builder().auto_add_history(true).build();
    let mut rl: Editor<CmdCompleter, DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.iter().map(|c| c.to_string()).collect(),
    }));
    let _ = rl.load_history(history);

    loop {
        match rl.readline("backend> ") {
            Ok(line) => match Command::parse(&line) {
                Some(Command::Status) => on_status().await,
                Some(Command::Port) => on_port().await,
                Some(Command::Stop) => {
                    on_stop().await;
                    break;
                }
                Some(Command::Exit) => break,
                None if line.trim().is_empty() => {}
                None => println!("Unknown command: {} (try: {})", line.trim(), COMMANDS.join(", ")),
            },
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    rl.save_history(history)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(Command::parse(" status "), Some(Command::Status));
        assert_eq!(Command::parse("port"), Some(Command::Port));
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("quit"), Some(Command::Exit));
        assert_eq!(Command::parse("restart"), None);
    }
}
