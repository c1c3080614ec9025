//! Parsing of the stage-1 `<|Commands|>` payload.
//!
//! The payload is a comma-separated list of `Action("arg")` items, or the
//! literal `None`.

use std::sync::LazyLock;

use mc_domain::error::{Error, Result};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Search,
    Calculate,
    Solve,
    Draw,
    Unknown(String),
}

impl Action {
    fn parse(name: &str) -> Self {
        match name {
            "Search" => Action::Search,
            "Calculate" => Action::Calculate,
            "Solve" => Action::Solve,
            "Draw" => Action::Draw,
            other => Action::Unknown(other.to_string()),
        }
    }

    /// Key in the plugin-enable map gating this action.
    pub fn plugin_key(&self) -> Option<&'static str> {
        match self {
            Action::Search => Some("search"),
            Action::Calculate => Some("calculator"),
            Action::Solve => Some("equation"),
            Action::Draw => Some("text-to-image"),
            Action::Unknown(_) => None,
        }
    }

    /// `type` tag of the extra data this action produces.
    pub fn kind(&self) -> &str {
        match self {
            Action::Search => "search",
            Action::Calculate => "calculate",
            Action::Solve => "solve",
            Action::Draw => "draw",
            Action::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub action: Action,
    pub arg: String,
}

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\w+)\s*\(([\s\S]*)\)\s*$").unwrap());

/// `true` for the literal "no tools" payload.
pub fn is_none_payload(payload: &str) -> bool {
    matches!(payload.trim(), "None" | "none")
}

/// Split at commas that are outside quotes and parentheses, so a query
/// like `Search("a, b")` stays one item.
fn split_items(payload: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in payload.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'' | '“') => quote = Some(if c == '“' { '”' } else { c }),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth <= 0 => {
                items.push(&payload[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&payload[start..]);
    items
}

fn strip_quotes(arg: &str) -> &str {
    let arg = arg.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if let Some(inner) = arg.strip_prefix(open).and_then(|a| a.strip_suffix(close)) {
            return inner.trim();
        }
    }
    arg
}

/// Parse a commands payload. `Ok(vec![])` means the payload was `None`.
pub fn parse_commands(payload: &str) -> Result<Vec<Command>> {
    if is_none_payload(payload) {
        return Ok(Vec::new());
    }
    if payload.trim().is_empty() {
        return Err(Error::InvalidCommandFormat("empty command list".into()));
    }

    split_items(payload)
        .into_iter()
        .map(|item| {
            let caps = ITEM_RE
                .captures(item)
                .ok_or_else(|| Error::InvalidCommandFormat(item.trim().to_string()))?;
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            Ok(Command {
                action: Action::parse(name),
                arg: strip_quotes(inner).to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_payload_has_no_commands() {
        assert!(parse_commands(" None").unwrap().is_empty());
        assert!(parse_commands("none").unwrap().is_empty());
    }

    #[test]
    fn parses_multiple_commands_in_order() {
        let cmds = parse_commands(r#" Search("weather in Shanghai"), Calculate("2+3*4")"#).unwrap();
        assert_eq!(
            cmds,
            vec![
                Command { action: Action::Search, arg: "weather in Shanghai".into() },
                Command { action: Action::Calculate, arg: "2+3*4".into() },
            ]
        );
    }

    #[test]
    fn arg_spans_first_open_to_last_close_paren() {
        let cmds = parse_commands(r#"Solve("f(x) = (x+1)^2, find x")"#).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].action, Action::Solve);
        assert_eq!(cmds[0].arg, "f(x) = (x+1)^2, find x");
    }

    #[test]
    fn unknown_actions_are_kept() {
        let cmds = parse_commands(r#"Translate("hola")"#).unwrap();
        assert_eq!(cmds[0].action, Action::Unknown("Translate".into()));
        assert_eq!(cmds[0].action.plugin_key(), None);
    }

    #[test]
    fn malformed_items_are_rejected() {
        assert!(matches!(
            parse_commands("search the web please"),
            Err(Error::InvalidCommandFormat(_))
        ));
        assert!(matches!(
            parse_commands(r#"Search("a"), oops"#),
            Err(Error::InvalidCommandFormat(_))
        ));
    }
}
