//! Filesystem notification backends

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use sandboxd_protocol::FileEventType;

/// Event parsed from one line of watcher output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub event_type: FileEventType,
    pub path: String,
    pub is_directory: bool,
}

/// A notification tool run as a subprocess that prints one event per line
pub trait FileWatcher: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Command that watches `path` and writes events to stdout
    fn command(&self, path: &Path, recursive: bool) -> Command;

    /// Parse one output line; `None` drops the line
    fn parse_line(&self, line: &str) -> Option<ParsedEvent>;
}

/// `inotifywait` in monitor mode
#[derive(Debug, Clone)]
pub struct InotifyWatcher {
    binary: String,
}

impl InotifyWatcher {
    pub const EVENTS: &'static str = "create,modify,delete,moved_from,moved_to,close_write";

    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for InotifyWatcher {
    fn default() -> Self {
        Self::new("inotifywait")
    }
}

impl FileWatcher for InotifyWatcher {
    fn name(&self) -> &str {
        &self.binary
    }

    fn command(&self, path: &Path, recursive: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-m").arg("-q");
        if recursive {
            cmd.arg("-r");
        }
        cmd.arg("-e")
            .arg(Self::EVENTS)
            .arg("--format")
            .arg("%e|%w%f|%e")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn parse_line(&self, line: &str) -> Option<ParsedEvent> {
        parse_inotify_event(line)
    }
}

/// Parse an `EVENTS|path|FLAGS` line
///
/// `CLOSE_WRITE` folds into `modify`. Lines that do not have this shape,
/// or whose event list names nothing we track, yield `None`.
pub fn parse_inotify_event(line: &str) -> Option<ParsedEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (events, rest) = line.split_once('|')?;
    let (path, flags) = rest.rsplit_once('|')?;
    if path.is_empty() {
        return None;
    }

    let names = || events.split(',').map(str::trim);
    let event_type = names().find_map(|name| match name {
        "CREATE" => Some(FileEventType::Create),
        "MODIFY" | "CLOSE_WRITE" => Some(FileEventType::Modify),
        "DELETE" => Some(FileEventType::Delete),
        "MOVED_FROM" => Some(FileEventType::MoveFrom),
        "MOVED_TO" => Some(FileEventType::MoveTo),
        _ => None,
    })?;

    let is_directory =
        names().any(|name| name == "ISDIR") || flags.split(',').any(|flag| flag.trim() == "ISDIR");

    Some(ParsedEvent {
        event_type,
        path: path.to_string(),
        is_directory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory_create() {
        let event = parse_inotify_event("CREATE,ISDIR|/app/newdir|ISDIR").unwrap();
        assert_eq!(
            event,
            ParsedEvent {
                event_type: FileEventType::Create,
                path: "/app/newdir".into(),
                is_directory: true,
            }
        );
    }

    #[test]
    fn test_parse_event_names() {
        let cases = [
            ("MODIFY|/a|MODIFY", FileEventType::Modify),
            ("CLOSE_WRITE,CLOSE|/a|CLOSE_WRITE,CLOSE", FileEventType::Modify),
            ("DELETE|/a|DELETE", FileEventType::Delete),
            ("MOVED_FROM|/a|MOVED_FROM", FileEventType::MoveFrom),
            ("MOVED_TO|/a|MOVED_TO", FileEventType::MoveTo),
        ];
        for (line, expected) in cases {
            let event = parse_inotify_event(line).unwrap();
            assert_eq!(event.event_type, expected, "{}", line);
            assert!(!event.is_directory);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_inotify_event("bad-line"), None);
        assert_eq!(parse_inotify_event(""), None);
        assert_eq!(parse_inotify_event("CREATE|/only-two-fields"), None);
        assert_eq!(parse_inotify_event("CREATE||"), None);
        assert_eq!(parse_inotify_event("OPEN|/a|OPEN"), None);
        assert_eq!(parse_inotify_event("DELETE_SELF|/a|DELETE_SELF"), None);
    }

    #[test]
    fn test_parse_path_with_pipe() {
        let event = parse_inotify_event("CREATE|/app/a|b.txt|CREATE\n").unwrap();
        assert_eq!(event.path, "/app/a|b.txt");
    }

    #[test]
    fn test_inotify_command_args() {
        let watcher = InotifyWatcher::default();
        let cmd = watcher.command(Path::new("/app"), true);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "inotifywait");
        assert!(args.contains(&"-r".to_string()));
        assert!(args.contains(&"%e|%w%f|%e".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/app"));

        let flat = watcher.command(Path::new("/app"), false);
        assert!(!flat.as_std().get_args().any(|a| a == "-r"));
    }
}
