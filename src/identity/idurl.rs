//! Identity URLs and rotation tracking
//!
//! A principal is named by an IDURL. When the identity servers hosting it
//! change, the principal keeps its key but gets a new IDURL; all forms seen
//! for the same principal must keep comparing equal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Identity URL of a peer
///
/// `Rotated` carries every older form, so two values compare equal when any
/// of their forms match. The empty IDURL marks a vacant supplier slot.
#[derive(Clone)]
pub enum IdUrl {
    Canonical(String),
    Rotated { current: String, history: Vec<String> },
}

impl IdUrl {
    pub fn new(text: impl Into<String>) -> Self {
        IdUrl::Canonical(text.into())
    }

    /// Vacant slot marker
    pub fn empty() -> Self {
        IdUrl::Canonical(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.to_text().is_empty()
    }

    /// Latest known textual form
    pub fn to_text(&self) -> &str {
        match self {
            IdUrl::Canonical(text) => text,
            IdUrl::Rotated { current, .. } => current,
        }
    }

    pub fn to_bin(&self) -> Vec<u8> {
        self.to_text().as_bytes().to_vec()
    }

    /// Current form first, then older forms
    pub fn forms(&self) -> impl Iterator<Item = &str> {
        let history: &[String] = match self {
            IdUrl::Canonical(_) => &[],
            IdUrl::Rotated { history, .. } => history,
        };
        std::iter::once(self.to_text()).chain(history.iter().map(String::as_str))
    }

    /// Whether `form` is one of the older forms of this IDURL
    pub fn was_rotated_from(&self, form: &str) -> bool {
        match self {
            IdUrl::Canonical(_) => false,
            IdUrl::Rotated { history, .. } => history.iter().any(|h| h == form),
        }
    }

    /// User name, the file stem of the URL path
    pub fn username(&self) -> String {
        let text = self.to_text();
        let tail = text.rsplit('/').next().unwrap_or(text);
        tail.strip_suffix(".xml").unwrap_or(tail).to_string()
    }
}

impl PartialEq for IdUrl {
    fn eq(&self, other: &Self) -> bool {
        self.forms().any(|a| other.forms().any(|b| a == b))
    }
}

impl Eq for IdUrl {}

impl PartialEq<str> for IdUrl {
    fn eq(&self, other: &str) -> bool {
        self.forms().any(|a| a == other)
    }
}

impl Default for IdUrl {
    fn default() -> Self {
        IdUrl::empty()
    }
}

impl From<&str> for IdUrl {
    fn from(text: &str) -> Self {
        IdUrl::new(text)
    }
}

impl From<String> for IdUrl {
    fn from(text: String) -> Self {
        IdUrl::new(text)
    }
}

impl fmt::Display for IdUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_text())
    }
}

impl fmt::Debug for IdUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdUrl::Canonical(text) => write!(f, "IdUrl({})", text),
            IdUrl::Rotated { current, history } => {
                write!(f, "IdUrl({} <- {:?})", current, history)
            }
        }
    }
}

impl Serialize for IdUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_text())
    }
}

impl<'de> Deserialize<'de> for IdUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(IdUrl::Canonical(String::deserialize(deserializer)?))
    }
}

#[derive(Default)]
struct InternerState {
    /// form -> principal index
    principal_of: HashMap<String, usize>,
    /// public key -> principal index
    principal_by_key: HashMap<String, usize>,
    /// forms per principal, oldest first
    forms: Vec<Vec<String>>,
}

impl InternerState {
    fn observe(&mut self, form: &str) -> usize {
        if let Some(&p) = self.principal_of.get(form) {
            return p;
        }
        let p = self.forms.len();
        self.forms.push(vec![form.to_string()]);
        self.principal_of.insert(form.to_string(), p);
        p
    }

    /// Fold principal `from` into `into`, keeping `into`'s forms older
    fn merge(&mut self, into: usize, from: usize) -> usize {
        if into == from {
            return into;
        }
        let moved = std::mem::take(&mut self.forms[from]);
        for form in moved {
            self.principal_of.insert(form.clone(), into);
            if !self.forms[into].contains(&form) {
                self.forms[into].push(form);
            }
        }
        for p in self.principal_by_key.values_mut() {
            if *p == from {
                *p = into;
            }
        }
        into
    }
}

/// Rotation interner
///
/// Maps every observed IDURL form to a principal so rotated forms compare
/// in constant time. Once two forms are linked they stay linked for the
/// lifetime of the interner.
#[derive(Default)]
pub struct IdUrlInterner {
    state: RwLock<InternerState>,
}

impl IdUrlInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a form, returning its principal index
    pub fn observe(&self, form: &str) -> usize {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.observe(form)
    }

    /// Record that `old` was rotated to `new`; `new` becomes the latest form
    pub fn record_rotation(&self, old: &str, new: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let a = state.observe(old);
        let b = state.observe(new);
        let p = state.merge(a, b);
        let forms = &mut state.forms[p];
        if let Some(i) = forms.iter().position(|f| f == new) {
            let latest = forms.remove(i);
            forms.push(latest);
        }
    }

    /// Link all sources of one identity document, keyed by its public key
    ///
    /// Returns true if this revealed a rotation of an already known principal.
    pub fn observe_identity(&self, sources: &[String], public_key: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(first) = sources.first() else {
            return false;
        };
        let mut p = state.observe(first);
        for source in &sources[1..] {
            let q = state.observe(source);
            p = state.merge(p, q);
        }
        let mut rotated = false;
        match state.principal_by_key.get(public_key).copied() {
            Some(known) if known != p => {
                p = state.merge(known, p);
                rotated = true;
            }
            Some(_) => {}
            None => {
                state.principal_by_key.insert(public_key.to_string(), p);
            }
        }
        if rotated {
            // the first source of the newest document is the current form
            let forms = &mut state.forms[p];
            if let Some(i) = forms.iter().position(|f| f == first) {
                let latest = forms.remove(i);
                forms.push(latest);
            }
        }
        rotated
    }

    /// Whether `a` and `b` name the same principal
    pub fn rotated_equal(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match (state.principal_of.get(a), state.principal_of.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Attach the rotation history known for `form`
    pub fn resolve(&self, form: &str) -> IdUrl {
        if form.is_empty() {
            return IdUrl::empty();
        }
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(&p) = state.principal_of.get(form) else {
            return IdUrl::new(form);
        };
        let forms = &state.forms[p];
        match forms.split_last() {
            Some((current, older)) if !older.is_empty() => IdUrl::Rotated {
                current: current.clone(),
                history: older.iter().rev().cloned().collect(),
            },
            _ => IdUrl::new(form),
        }
    }

    /// Upgrade a deserialized IDURL with its known history
    pub fn canonicalize(&self, idurl: &IdUrl) -> IdUrl {
        self.resolve(idurl.to_text())
    }

    /// `form` itself followed by up to `limit` other known forms, newest first
    pub fn rotations(&self, form: &str, limit: usize) -> Vec<String> {
        let mut result = vec![form.to_string()];
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if let Some(&p) = state.principal_of.get(form) {
            result.extend(
                state.forms[p]
                    .iter()
                    .rev()
                    .filter(|f| f.as_str() != form)
                    .take(limit)
                    .cloned(),
            );
        }
        result
    }
}
