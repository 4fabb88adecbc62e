//! Ordered command-line parameters with keyed editing and variable substitution.
//!
//! A `ParameterStore` keeps argument tokens in insertion order. Tokens starting with the
//! key prefix (`-` by default) are flag keys, the token following a key is its value unless
//! it is itself a key. Tokens wrapped in the variable tags (`<%NAME%>` by default) are
//! placeholders filled by [`ParameterStore::substitute`].

use std::collections::HashMap;
use std::fmt;

use crate::error::{ExecError, Result};

/// Default prefix recognizing flag keys.
pub const DEFAULT_KEY_PREFIX: &str = "-";
/// Default opening tag of a variable token.
pub const DEFAULT_VAR_START: &str = "<%";
/// Default closing tag of a variable token.
pub const DEFAULT_VAR_END: &str = "%>";

/// Key prefix and variable tags used to interpret tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSyntax {
    key_prefix: String,
    var_start: String,
    var_end: String,
}

impl ParamSyntax {
    /// Creates a syntax, rejecting empty prefix or tags.
    pub fn new(
        key_prefix: impl Into<String>,
        var_start: impl Into<String>,
        var_end: impl Into<String>,
    ) -> Result<Self> {
        let syntax = Self {
            key_prefix: key_prefix.into(),
            var_start: var_start.into(),
            var_end: var_end.into(),
        };
        if syntax.key_prefix.is_empty() {
            return Err(ExecError::Config("parameter key prefix can't be empty".into()));
        }
        if syntax.var_start.is_empty() || syntax.var_end.is_empty() {
            return Err(ExecError::Config("variable tags can't be empty".into()));
        }
        Ok(syntax)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn var_start(&self) -> &str {
        &self.var_start
    }

    pub fn var_end(&self) -> &str {
        &self.var_end
    }
}

impl Default for ParamSyntax {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            var_start: DEFAULT_VAR_START.to_string(),
            var_end: DEFAULT_VAR_END.to_string(),
        }
    }
}

/// Splits a raw command-line string into tokens.
///
/// Whitespace separates tokens outside of double-quote spans. A quote opens a span and the
/// next quote closes it; an unterminated span runs to the end of input. Both quotes are token
/// boundaries, so `a"b c"d` yields `a`, `b c` and `d`. Quote characters are never part of a
/// token, and a span that produces no characters yields no token.
pub fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in raw.chars() {
        match c {
            '"' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Ordered, mutable list of argument tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterStore {
    syntax: ParamSyntax,
    tokens: Vec<String>,
}

impl ParameterStore {
    /// Creates an empty store with the default syntax.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store interpreting tokens with `syntax`.
    pub fn with_syntax(syntax: ParamSyntax) -> Self {
        Self {
            syntax,
            tokens: Vec::new(),
        }
    }

    /// Creates a store from a raw command-line string with the default syntax.
    pub fn parse(raw: &str) -> Self {
        let mut store = Self::new();
        store.add_bulk(raw);
        store
    }

    pub fn syntax(&self) -> &ParamSyntax {
        &self.syntax
    }

    /// Appends tokens, skipping absent entries.
    pub fn add<I, S>(&mut self, tokens: I) -> &mut Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        self.tokens.extend(tokens.into_iter().flatten().map(Into::into));
        self
    }

    /// Appends every token of `args`.
    pub fn add_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(args.into_iter().map(Into::into));
        self
    }

    /// Tokenizes `raw` and appends the result.
    pub fn add_bulk(&mut self, raw: &str) -> &mut Self {
        self.tokens.extend(tokenize(raw));
        self
    }

    /// Inserts tokens in front of the current ones, keeping their relative order.
    pub fn prepend<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut front: Vec<String> = args.into_iter().map(Into::into).collect();
        front.append(&mut self.tokens);
        self.tokens = front;
        self
    }

    /// Tokenizes `raw` and inserts the result in front of the current tokens.
    pub fn prepend_bulk(&mut self, raw: &str) -> &mut Self {
        self.prepend(tokenize(raw))
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// Whether `token` looks like a flag key.
    pub fn is_key(&self, token: &str) -> bool {
        token.starts_with(&self.syntax.key_prefix)
    }

    fn normalize_key(&self, key: &str) -> String {
        if self.is_key(key) {
            key.to_string()
        } else {
            format!("{}{}", self.syntax.key_prefix, key)
        }
    }

    fn key_positions(&self, key: &str) -> Vec<usize> {
        let key = self.normalize_key(key);
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| **token == key)
            .map(|(pos, _)| pos)
            .collect()
    }

    fn value_after(&self, pos: usize) -> Option<&String> {
        self.tokens.get(pos + 1).filter(|next| !self.is_key(next))
    }

    /// Whether `key` occurs at least once.
    pub fn has_key(&self, key: &str) -> bool {
        !self.key_positions(key).is_empty()
    }

    /// Values following each occurrence of `key`.
    ///
    /// Returns `None` when the key never occurs, and an empty list when it occurs only
    /// without values.
    pub fn values_of(&self, key: &str) -> Option<Vec<String>> {
        let positions = self.key_positions(key);
        if positions.is_empty() {
            return None;
        }
        Some(
            positions
                .into_iter()
                .filter_map(|pos| self.value_after(pos).cloned())
                .collect(),
        )
    }

    /// Value following the first occurrence of `key`, if any.
    pub fn first_value(&self, key: &str) -> Option<String> {
        self.values_of(key)?.into_iter().next()
    }

    /// Removes the `occurrence`-th (0-based) `key` and its value.
    ///
    /// Returns `false` when that occurrence does not exist.
    pub fn remove(&mut self, key: &str, occurrence: usize) -> bool {
        let Some(pos) = self.key_positions(key).get(occurrence).copied() else {
            return false;
        };
        if self.value_after(pos).is_some() {
            self.tokens.drain(pos..pos + 2);
        } else {
            self.tokens.remove(pos);
        }
        true
    }

    /// Sets the value of the `occurrence`-th (0-based) `key`.
    ///
    /// An existing value is replaced; a missing one is inserted right after the key.
    /// Returns `false` when that occurrence does not exist.
    pub fn alter(&mut self, key: &str, value: impl Into<String>, occurrence: usize) -> bool {
        let Some(pos) = self.key_positions(key).get(occurrence).copied() else {
            return false;
        };
        let value = value.into();
        if self.value_after(pos).is_some() {
            self.tokens[pos + 1] = value;
        } else {
            self.tokens.insert(pos + 1, value);
        }
        true
    }

    /// Whether `token` is a variable placeholder.
    pub fn is_variable(&self, token: &str) -> bool {
        let ParamSyntax {
            var_start, var_end, ..
        } = &self.syntax;
        token.len() > var_start.len() + var_end.len()
            && token.starts_with(var_start.as_str())
            && token.ends_with(var_end.as_str())
    }

    /// Name carried by a variable placeholder, `None` for literal tokens.
    pub fn variable_name<'a>(&self, token: &'a str) -> Option<&'a str> {
        if !self.is_variable(token) {
            return None;
        }
        Some(&token[self.syntax.var_start.len()..token.len() - self.syntax.var_end.len()])
    }

    /// Wraps `name` in the variable tags.
    pub fn make_variable(&self, name: &str) -> String {
        format!("{}{}{}", self.syntax.var_start, name, self.syntax.var_end)
    }

    /// Names of every variable placeholder, in token order.
    pub fn variable_names(&self) -> Vec<String> {
        self.tokens
            .iter()
            .filter_map(|token| self.variable_name(token))
            .map(str::to_string)
            .collect()
    }

    /// Replaces variable placeholders with their bound values.
    ///
    /// A placeholder without a binding is dropped. With `drop_unresolved_keyed`, the key
    /// token right before it is dropped as well, so `-flag <%X%>` vanishes as a pair.
    pub fn substitute(&mut self, vars: &HashMap<String, String>, drop_unresolved_keyed: bool) {
        let mut out: Vec<String> = Vec::with_capacity(self.tokens.len());
        for token in std::mem::take(&mut self.tokens) {
            let Some(name) = self.variable_name(&token).map(str::to_string) else {
                out.push(token);
                continue;
            };
            match vars.get(&name) {
                Some(value) => out.push(value.clone()),
                None => {
                    if drop_unresolved_keyed && out.last().is_some_and(|prev| self.is_key(prev)) {
                        out.pop();
                    }
                }
            }
        }
        self.tokens = out;
    }
}

impl fmt::Display for ParameterStore {
    /// Renders the tokens so that [`tokenize`] gives them back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .tokens
            .iter()
            .map(|token| {
                if token.chars().any(char::is_whitespace) {
                    format!("\"{}\"", token)
                } else {
                    token.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&rendered)
    }
}
