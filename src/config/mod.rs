//! Stack configuration input adapter.
//!
//! Turns the flat string form `name(k=v;k=v):name(...):...`, given
//! directly or as the contents of a file, into an ordered list of
//! protocol descriptors, bottom layer first. Property values support
//! `${name:default}` substitution against the process environment.

use {
	crate::error::ConfigError,
	std::{collections::HashMap, path::Path},
};

/// One layer descriptor: a registered protocol name plus its properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
	pub name: String,
	pub properties: HashMap<String, String>,
}

/// An ordered list of layer descriptors, bottom (transport) first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
	pub protocols: Vec<ProtocolConfig>,
}

impl StackConfig {
	/// Resolves a configuration input string.
	///
	/// If the string names an existing file, the file's contents are
	/// parsed as the flat form; otherwise the string itself is.
	pub fn resolve(input: &str) -> Result<Self, ConfigError> {
		let path = Path::new(input);
		if path.is_file() {
			let contents = std::fs::read_to_string(path)?;
			return Self::parse(contents.trim());
		}
		Self::parse(input)
	}

	/// Parses the flat string form.
	pub fn parse(input: &str) -> Result<Self, ConfigError> {
		let input = input.trim();
		if input.is_empty() {
			return Err(ConfigError::Parse("empty stack configuration".into()));
		}

		let mut protocols = Vec::new();
		for entry in split_top_level(input)? {
			protocols.push(parse_protocol(entry)?);
		}
		Ok(Self { protocols })
	}
}

/// Splits `a:b(x=1):c` on the `:` separators outside parentheses.
fn split_top_level(input: &str) -> Result<Vec<&str>, ConfigError> {
	let mut entries = Vec::new();
	let mut depth = 0usize;
	let mut start = 0usize;

	for (i, ch) in input.char_indices() {
		match ch {
			'(' => depth += 1,
			')' => {
				depth = depth.checked_sub(1).ok_or_else(|| {
					ConfigError::Parse(format!("unbalanced `)` at offset {i}"))
				})?;
			}
			':' if depth == 0 => {
				entries.push(&input[start..i]);
				start = i + 1;
			}
			_ => {}
		}
	}
	if depth != 0 {
		return Err(ConfigError::Parse("unbalanced `(`".into()));
	}
	entries.push(&input[start..]);
	Ok(entries)
}

fn parse_protocol(entry: &str) -> Result<ProtocolConfig, ConfigError> {
	let entry = entry.trim();
	if entry.is_empty() {
		return Err(ConfigError::Parse("empty protocol entry".into()));
	}

	let (name, props) = match entry.split_once('(') {
		None => (entry, None),
		Some((name, rest)) => {
			let props = rest.strip_suffix(')').ok_or_else(|| {
				ConfigError::Parse(format!("missing `)` in `{entry}`"))
			})?;
			(name.trim(), Some(props))
		}
	};

	if name.is_empty() {
		return Err(ConfigError::Parse(format!(
			"missing protocol name in `{entry}`"
		)));
	}

	let mut properties = HashMap::new();
	if let Some(props) = props {
		for pair in props.split(';').filter(|p| !p.trim().is_empty()) {
			let (key, value) = pair.split_once('=').ok_or_else(|| {
				ConfigError::Parse(format!("expected `key=value`, got `{pair}`"))
			})?;
			properties.insert(
				key.trim().to_owned(),
				substitute_variables(value.trim())?,
			);
		}
	}

	Ok(ProtocolConfig {
		name: name.to_owned(),
		properties,
	})
}

/// Replaces every `${name}` / `${name:default}` occurrence with the value
/// of the process environment variable `name`, falling back to the given
/// default. A variable with neither a value nor a default is an error.
pub fn substitute_variables(value: &str) -> Result<String, ConfigError> {
	let mut out = String::with_capacity(value.len());
	let mut rest = value;

	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let tail = &rest[start + 2..];
		let end = tail.find('}').ok_or_else(|| {
			ConfigError::Parse(format!("unterminated `${{` in `{value}`"))
		})?;
		let var = &tail[..end];
		let (name, default) = match var.split_once(':') {
			Some((name, default)) => (name, Some(default)),
			None => (var, None),
		};
		match std::env::var(name) {
			Ok(v) => out.push_str(&v),
			Err(_) => match default {
				Some(d) => out.push_str(d),
				None => {
					return Err(ConfigError::UnresolvedVariable(name.to_owned()));
				}
			},
		}
		rest = &tail[end + 1..];
	}
	out.push_str(rest);
	Ok(out)
}

/// Rejects property keys a protocol does not understand. Used by the
/// protocol factories so that misspelled keys fail stack creation instead
/// of being silently ignored.
pub(crate) fn reject_unknown_properties(
	protocol: &str,
	properties: &HashMap<String, String>,
	known: &[&str],
) -> Result<(), ConfigError> {
	for key in properties.keys() {
		if !known.contains(&key.as_str()) {
			return Err(ConfigError::UnknownProperty {
				protocol: protocol.to_owned(),
				key: key.clone(),
			});
		}
	}
	Ok(())
}
