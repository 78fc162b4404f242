use super::EngineResult;
use std::{io::ErrorKind, path::Path};
use tokio::fs;

pub const PROPERTIES_FILE: &str = "server.properties";
pub const DEFAULT_PORT: u16 = 25565;

pub const DEFAULT_PROPERTIES: &str = "\
#Minecraft server properties
server-port=25565
motd=A Minecraft Server
difficulty=easy
gamemode=survival
max-players=20
online-mode=true
";

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
        return None;
    }
    let (key, value) = trimmed.split_once(['=', ':'])?;
    Some((key.trim(), value.trim()))
}

/// Java reads a backslash as the start of an escape, so it is doubled on write.
fn escape(value: &str) -> String {
    value.replace('\\', "\\\\")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{0c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push('u');
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

pub fn get(contents: &str, key: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(parse_line)
        .find(|(k, _)| *k == key)
        .map(|(_, v)| unescape(v))
}

/// Replaces the first assignment of `key`, or appends one. Comments and the
/// order of other keys are left alone.
pub fn set(contents: &str, key: &str, value: &str) -> String {
    let mut replaced = false;
    let mut out = String::with_capacity(contents.len() + key.len() + value.len() + 2);

    for line in contents.lines() {
        match parse_line(line) {
            Some((k, _)) if k == key && !replaced => {
                out.push_str(&format!("{}={}", key, escape(value)));
                replaced = true;
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }

    if !replaced {
        out.push_str(&format!("{}={}\n", key, escape(value)));
    }
    out
}

pub fn port(contents: &str) -> u16 {
    get(contents, "server-port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn load(dir: &Path) -> EngineResult<String> {
    match fs::read_to_string(dir.join(PROPERTIES_FILE)).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

pub async fn read_value(dir: &Path, key: &str) -> EngineResult<Option<String>> {
    Ok(get(&load(dir).await?, key))
}

pub async fn write_value(dir: &Path, key: &str, value: &str) -> EngineResult<()> {
    let updated = set(&load(dir).await?, key, value);
    fs::write(dir.join(PROPERTIES_FILE), updated).await?;
    Ok(())
}
