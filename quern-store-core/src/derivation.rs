//! The derivation model and its ATerm on-disk codec.
//!
//! A derivation file holds one term:
//!
//! ```text
//! Derive([("out","/path","sha256","<hex>")...],   // outputs
//!        [("/drv",["out"])...],                   // input derivations
//!        ["/src"...],                             // input sources
//!        "platform","builder",["arg"...],
//!        [("VAR","value")...])                    // environment
//! ```
//!
//! A non-empty output hash marks a fixed-output derivation.  The same module
//! parses the legacy `Closure([roots],[(path,[refs])...])` terms that the
//! schema upgrade reads out of old stores.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use thiserror::Error;

use crate::store_path::PathSet;

/// Error produced while decoding a term.
#[derive(Debug, Error)]
#[error("malformed term at byte {offset}: {message}")]
pub struct ATermError {
    pub offset: usize,
    pub message: String,
}

/// One output slot of a derivation.  `hash_algo`/`hash` are empty unless the
/// derivation is fixed-output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivationOutput {
    pub path: PathBuf,
    pub hash_algo: String,
    pub hash: String,
}

impl DerivationOutput {
    pub fn is_fixed(&self) -> bool {
        !self.hash.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Derivation {
    pub outputs: BTreeMap<String, DerivationOutput>,
    pub input_drvs: BTreeMap<PathBuf, BTreeSet<String>>,
    pub input_srcs: PathSet,
    pub platform: String,
    pub builder: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Derivation {
    /// The set of output paths this derivation produces.
    pub fn output_paths(&self) -> PathSet {
        self.outputs.values().map(|o| o.path.clone()).collect()
    }

    /// Parse a derivation term.
    pub fn parse(input: &str) -> Result<Derivation, ATermError> {
        let mut c = Cursor::new(input);
        let mut drv = Derivation::default();

        c.eat("Derive(")?;

        c.seq(|c| {
            c.eat("(")?;
            let name = c.string()?;
            c.eat(",")?;
            let path = c.string()?;
            c.eat(",")?;
            let hash_algo = c.string()?;
            c.eat(",")?;
            let hash = c.string()?;
            c.eat(")")?;
            drv.outputs.insert(
                name,
                DerivationOutput {
                    path: PathBuf::from(path),
                    hash_algo,
                    hash,
                },
            );
            Ok(())
        })?;

        c.eat(",")?;
        c.seq(|c| {
            c.eat("(")?;
            let drv_path = c.string()?;
            c.eat(",")?;
            let mut wanted = BTreeSet::new();
            c.seq(|c| {
                wanted.insert(c.string()?);
                Ok(())
            })?;
            c.eat(")")?;
            drv.input_drvs.insert(PathBuf::from(drv_path), wanted);
            Ok(())
        })?;

        c.eat(",")?;
        c.seq(|c| {
            drv.input_srcs.insert(PathBuf::from(c.string()?));
            Ok(())
        })?;

        c.eat(",")?;
        drv.platform = c.string()?;
        c.eat(",")?;
        drv.builder = PathBuf::from(c.string()?);

        c.eat(",")?;
        c.seq(|c| {
            drv.args.push(c.string()?);
            Ok(())
        })?;

        c.eat(",")?;
        c.seq(|c| {
            c.eat("(")?;
            let key = c.string()?;
            c.eat(",")?;
            let value = c.string()?;
            c.eat(")")?;
            drv.env.insert(key, value);
            Ok(())
        })?;

        c.eat(")")?;
        c.finish()?;

        Ok(drv)
    }

    /// Serialise back to the on-disk term.  `parse` of the result yields an
    /// equal derivation.
    pub fn unparse(&self) -> String {
        let mut s = String::with_capacity(1024);
        s.push_str("Derive(");

        quote_seq(&mut s, &self.outputs, |s, (name, out)| {
            s.push('(');
            quote(s, name);
            s.push(',');
            quote(s, &out.path.to_string_lossy());
            s.push(',');
            quote(s, &out.hash_algo);
            s.push(',');
            quote(s, &out.hash);
            s.push(')');
        });

        s.push(',');
        quote_seq(&mut s, &self.input_drvs, |s, (drv, wanted)| {
            s.push('(');
            quote(s, &drv.to_string_lossy());
            s.push(',');
            quote_seq(s, wanted, |s, w| quote(s, w));
            s.push(')');
        });

        s.push(',');
        quote_seq(&mut s, &self.input_srcs, |s, src| {
            quote(s, &src.to_string_lossy())
        });

        s.push(',');
        quote(&mut s, &self.platform);
        s.push(',');
        quote(&mut s, &self.builder.to_string_lossy());

        s.push(',');
        quote_seq(&mut s, &self.args, |s, a| quote(s, a));

        s.push(',');
        quote_seq(&mut s, &self.env, |s, (k, v)| {
            s.push('(');
            quote(s, k);
            s.push(',');
            quote(s, v);
            s.push(')');
        });

        s.push(')');
        s
    }
}

/// A parsed legacy closure term (schema 1 stores kept these as `*.store`
/// files next to the artifacts they describe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyClosure {
    pub roots: Vec<PathBuf>,
    pub elements: Vec<(PathBuf, Vec<PathBuf>)>,
}

/// Parse a `Closure([roots],[(path,[refs])...])` term.
pub fn parse_legacy_closure(input: &str) -> Result<LegacyClosure, ATermError> {
    let mut c = Cursor::new(input);
    let mut closure = LegacyClosure {
        roots: Vec::new(),
        elements: Vec::new(),
    };

    c.eat("Closure(")?;

    c.seq(|c| {
        closure.roots.push(PathBuf::from(c.string()?));
        Ok(())
    })?;

    c.eat(",")?;
    c.seq(|c| {
        c.eat("(")?;
        let path = PathBuf::from(c.string()?);
        c.eat(",")?;
        let mut refs = Vec::new();
        c.seq(|c| {
            refs.push(PathBuf::from(c.string()?));
            Ok(())
        })?;
        c.eat(")")?;
        closure.elements.push((path, refs));
        Ok(())
    })?;

    c.eat(")")?;
    c.finish()?;

    Ok(closure)
}

// ── Serialisation helpers ───────────────────────────────────────────────────

fn quote(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
}

fn quote_seq<T>(
    out: &mut String,
    items: impl IntoIterator<Item = T>,
    mut each: impl FnMut(&mut String, T),
) {
    out.push('[');
    for (n, item) in items.into_iter().enumerate() {
        if n > 0 {
            out.push(',');
        }
        each(out, item);
    }
    out.push(']');
}

// ── Decoder ─────────────────────────────────────────────────────────────────

/// A byte cursor over the term text.  Terms are ASCII punctuation around
/// quoted strings, so matching works on bytes and only the decoded string
/// payloads are checked for UTF-8.
struct Cursor<'t> {
    text: &'t str,
    at: usize,
}

impl<'t> Cursor<'t> {
    fn new(text: &'t str) -> Cursor<'t> {
        Cursor { text, at: 0 }
    }

    fn rest(&self) -> &'t str {
        &self.text[self.at..]
    }

    fn err(&self, message: impl Into<String>) -> ATermError {
        ATermError {
            offset: self.at,
            message: message.into(),
        }
    }

    /// Consume an exact token, of any length.
    fn eat(&mut self, token: &str) -> Result<(), ATermError> {
        if self.eat_opt(token) {
            return Ok(());
        }
        let found: String = self.rest().chars().take(12).collect();
        if found.is_empty() {
            Err(self.err(format!("expected {token:?}, found end of term")))
        } else {
            Err(self.err(format!("expected {token:?}, found {found:?}")))
        }
    }

    /// Consume `token` if it is next; report whether it was.
    fn eat_opt(&mut self, token: &str) -> bool {
        match self.rest().strip_prefix(token) {
            Some(stripped) => {
                self.at = self.text.len() - stripped.len();
                true
            }
            None => false,
        }
    }

    fn next_byte(&mut self) -> Result<u8, ATermError> {
        match self.text.as_bytes().get(self.at) {
            Some(&b) => {
                self.at += 1;
                Ok(b)
            }
            None => Err(self.err("unexpected end of term")),
        }
    }

    /// A double-quoted string with backslash escapes.  The payload is
    /// collected as raw bytes and validated as UTF-8 once.
    fn string(&mut self) -> Result<String, ATermError> {
        self.eat("\"")?;
        let start = self.at;
        let mut raw = Vec::new();
        loop {
            match self.next_byte()? {
                b'"' => break,
                b'\\' => {
                    let code = self.next_byte()?;
                    raw.push(match code {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => other,
                    });
                }
                other => raw.push(other),
            }
        }
        String::from_utf8(raw).map_err(|_| ATermError {
            offset: start,
            message: "string is not valid UTF-8".into(),
        })
    }

    /// A bracketed, comma-separated sequence; `item` consumes one element.
    fn seq(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<(), ATermError>,
    ) -> Result<(), ATermError> {
        self.eat("[")?;
        if self.eat_opt("]") {
            return Ok(());
        }
        loop {
            item(self)?;
            if self.eat_opt("]") {
                return Ok(());
            }
            self.eat(",")?;
        }
    }

    /// Require that nothing but trailing whitespace remains.
    fn finish(&self) -> Result<(), ATermError> {
        if self.rest().chars().all(char::is_whitespace) {
            Ok(())
        } else {
            Err(self.err("trailing garbage after term"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Derivation {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "out".to_string(),
            DerivationOutput {
                path: PathBuf::from("/quern/store/aaaa-hello"),
                hash_algo: String::new(),
                hash: String::new(),
            },
        );
        let mut input_drvs = BTreeMap::new();
        input_drvs.insert(
            PathBuf::from("/quern/store/bbbb-dep.drv"),
            BTreeSet::from(["out".to_string()]),
        );
        let mut env = BTreeMap::new();
        env.insert("out".to_string(), "/quern/store/aaaa-hello".to_string());
        env.insert("msg".to_string(), "two\nlines \"quoted\" \\slashed".to_string());
        Derivation {
            outputs,
            input_drvs,
            input_srcs: PathSet::from([PathBuf::from("/quern/store/cccc-src")]),
            platform: "x86_64-linux".to_string(),
            builder: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "echo hello > $out".to_string()],
            env,
        }
    }

    #[test]
    fn test_roundtrip() {
        let drv = sample();
        let parsed = Derivation::parse(&drv.unparse()).unwrap();
        assert_eq!(drv, parsed);
    }

    #[test]
    fn test_parse_fixed_output() {
        let term = r#"Derive([("out","/quern/store/dddd-tarball","sha256","ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")],[],[],"x86_64-linux","/bin/fetch",[],[])"#;
        let drv = Derivation::parse(term).unwrap();
        let out = &drv.outputs["out"];
        assert!(out.is_fixed());
        assert_eq!(out.hash_algo, "sha256");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Derivation::parse("Derive(").is_err());
        assert!(Derivation::parse("NotADerivation()").is_err());
        // A valid term followed by junk is refused too.
        let trailing = sample().unparse() + "leftover";
        assert!(Derivation::parse(&trailing).is_err());
    }

    #[test]
    fn test_error_carries_offset() {
        let e = Derivation::parse("Derive([x])").unwrap_err();
        assert!(e.offset > 0);
        assert!(e.message.contains("expected"));
    }

    #[test]
    fn test_output_paths() {
        assert_eq!(
            sample().output_paths(),
            PathSet::from([PathBuf::from("/quern/store/aaaa-hello")])
        );
    }

    #[test]
    fn test_legacy_closure() {
        let term = r#"Closure(["/quern/store/aaaa-app"],[("/quern/store/aaaa-app",["/quern/store/bbbb-lib"]),("/quern/store/bbbb-lib",[])])"#;
        let closure = parse_legacy_closure(term).unwrap();
        assert_eq!(closure.roots.len(), 1);
        assert_eq!(closure.elements.len(), 2);
        assert_eq!(
            closure.elements[0].1,
            vec![PathBuf::from("/quern/store/bbbb-lib")]
        );
    }
}
