use std::fmt::Display;
use std::str::FromStr;

/// Point in a unit's run where hooks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// After the module is copied, before anything is generated
    Prepare,
    /// After the provisioner command succeeded
    Finish,
}

impl FromStr for Event {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prepare" => Ok(Event::Prepare),
            "finish" => Ok(Event::Finish),
            _ => Err(TriggerError::UnknownEvent(s.to_string())),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Prepare => write!(f, "prepare"),
            Event::Finish => write!(f, "finish"),
        }
    }
}

/// `event` or `event:command,command`
///
/// Without a command list the trigger fires for every provisioner command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub event: Event,
    /// lower case
    pub commands: Vec<String>,
}

impl Trigger {
    pub fn matches(&self, event: Event, command: &str) -> bool {
        self.event == event
            && (self.commands.is_empty()
                || self
                    .commands
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(command)))
    }
}

impl FromStr for Trigger {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (event, commands) = match s.split_once(':') {
            Some((event, commands)) => {
                let commands: Vec<String> = commands
                    .split(',')
                    .map(|command| command.trim().to_ascii_lowercase())
                    .filter(|command| !command.is_empty())
                    .collect();
                if commands.is_empty() {
                    return Err(TriggerError::EmptyCommandList(s.to_string()));
                }
                (event, commands)
            }
            None => (s, vec![]),
        };

        Ok(Trigger {
            event: event.parse()?,
            commands,
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TriggerError {
    #[error("unknown hook event `{0}` (expected `prepare` or `finish`)")]
    UnknownEvent(String),
    #[error("trigger `{0}` has an empty command list")]
    EmptyCommandList(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_list() {
        let trigger: Trigger = "finish:init,plan".parse().unwrap();
        assert!(trigger.matches(Event::Finish, "plan"));
        assert!(trigger.matches(Event::Finish, "init"));
        assert!(!trigger.matches(Event::Prepare, "init"));
        assert!(!trigger.matches(Event::Finish, "apply"));
    }

    #[test]
    fn event_only_matches_any_command() {
        let trigger: Trigger = "prepare".parse().unwrap();
        assert!(trigger.matches(Event::Prepare, "apply"));
        assert!(trigger.matches(Event::Prepare, "destroy"));
        assert!(!trigger.matches(Event::Finish, "apply"));
    }

    #[test]
    fn case_insensitive() {
        let trigger: Trigger = "Prepare: Plan , APPLY".parse().unwrap();
        assert_eq!(
            trigger,
            Trigger {
                event: Event::Prepare,
                commands: vec!["plan".into(), "apply".into()]
            }
        );
        assert!(trigger.matches(Event::Prepare, "PLAN"));
    }

    #[test]
    fn invalid() {
        assert_eq!(
            "teardown".parse::<Trigger>(),
            Err(TriggerError::UnknownEvent("teardown".into()))
        );
        assert_eq!(
            "finish:".parse::<Trigger>(),
            Err(TriggerError::EmptyCommandList("finish:".into()))
        );
        assert!("".parse::<Trigger>().is_err());
    }
}
