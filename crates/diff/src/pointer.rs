//! RFC 6901 JSON pointer helpers.

use serde_json::Value as Json;

pub fn escape(token: &str) -> String { token.replace('~', "~0").replace('/', "~1") }

pub fn unescape(token: &str) -> String { token.replace("~1", "/").replace("~0", "~") }

pub fn tokens(pointer: &str) -> Vec<String> {
    if pointer.is_empty() || pointer == "/" {
        return Vec::new();
    }
    pointer.trim_start_matches('/').split('/').map(unescape).collect()
}

pub fn join(tokens: &[String]) -> String {
    let mut out = String::new();
    for t in tokens {
        out.push('/');
        out.push_str(&escape(t));
    }
    out
}

/// Remove the value at `pointer`; a missing path is a no-op. Returns whether anything was removed.
pub fn remove(doc: &mut Json, pointer: &str) -> bool {
    let toks = tokens(pointer);
    let Some((last, parents)) = toks.split_last() else { return false };
    let mut cur = doc;
    for t in parents {
        cur = match step_mut(cur, t) {
            Some(next) => next,
            None => return false,
        };
    }
    match cur {
        Json::Object(m) => m.remove(last).is_some(),
        Json::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

/// Set the value at `pointer`, creating intermediate objects. Fails silently through arrays
/// that are too short.
pub fn set(doc: &mut Json, pointer: &str, value: Json) {
    let toks = tokens(pointer);
    let Some((last, parents)) = toks.split_last() else {
        *doc = value;
        return;
    };
    let mut cur = doc;
    for t in parents {
        if cur.is_null() {
            *cur = Json::Object(Default::default());
        }
        let next = match cur {
            Json::Object(m) => Some(m.entry(t.clone()).or_insert(Json::Null)),
            Json::Array(items) => match t.parse::<usize>() {
                Ok(i) => items.get_mut(i),
                Err(_) => None,
            },
            _ => None,
        };
        cur = match next {
            Some(n) => n,
            None => return,
        };
    }
    if cur.is_null() {
        *cur = Json::Object(Default::default());
    }
    match cur {
        Json::Object(m) => {
            m.insert(last.clone(), value);
        }
        Json::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if let Some(slot) = items.get_mut(i) {
                    *slot = value;
                }
            }
        }
        _ => {}
    }
}

fn step_mut<'a>(cur: &'a mut Json, token: &str) -> Option<&'a mut Json> {
    match cur {
        Json::Object(m) => m.get_mut(token),
        Json::Array(items) => match token.parse::<usize>() {
            Ok(i) => items.get_mut(i),
            Err(_) => None,
        },
        _ => None,
    }
}
