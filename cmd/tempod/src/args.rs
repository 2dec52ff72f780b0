//! Minimal `--key value` command-line parsing.
//!
//! Flags (`--help`) and key/value pairs (`--port 7070`) only; a value is
//! whatever follows a `--key` token without a leading `--`. Callers pop
//! what they understand; anything left over is an error, so a typoed
//! option never passes silently.

use std::collections::HashMap;
use std::str::FromStr;

pub struct Args {
    /// `--key value` pairs, keyed without the leading dashes.
    kv: HashMap<String, String>,
    /// Bare `--flag` tokens.
    flags: Vec<String>,
}

impl Args {
    pub fn parse(argv: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut kv = HashMap::new();
        let mut flags = Vec::new();

        let tokens: Vec<String> = argv.collect();
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            let key = match tok.strip_prefix("--") {
                Some(k) if !k.is_empty() => k,
                _ => return Err(format!("unexpected argument: {:?}", tok)),
            };

            match tokens.get(i + 1) {
                Some(val) if !val.starts_with("--") => {
                    if kv.insert(key.to_string(), val.clone()).is_some() {
                        return Err(format!("duplicate option: --{}", key));
                    }
                    i += 2;
                }
                _ => {
                    flags.push(key.to_string());
                    i += 1;
                }
            }
        }

        Ok(Self { kv, flags })
    }

    /// Remove and report a bare flag.
    pub fn pop_flag(&mut self, name: &str) -> bool {
        match self.flags.iter().position(|f| f == name) {
            Some(idx) => {
                self.flags.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remove and parse `--name value`. `Ok(None)` when absent.
    pub fn pop_kv<T: FromStr>(&mut self, name: &str) -> Result<Option<T>, String>
    where
        T::Err: std::fmt::Display,
    {
        match self.kv.remove(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| format!("invalid --{} {:?}: {}", name, raw, e)),
        }
    }

    /// Error unless everything was consumed.
    pub fn finish(self) -> Result<(), String> {
        if let Some(key) = self.kv.keys().next() {
            return Err(format!("unknown option: --{}", key));
        }
        if let Some(flag) = self.flags.first() {
            return Err(format!("unknown flag: --{}", flag));
        }
        Ok(())
    }
}
