//! Payload decoding helpers.
//!
//! With the `tracing` feature enabled, decoding reports fields the target type does not know
//! about, which is how protocol drift on the gateway side shows up first.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Decode `value` into `T`.
///
/// Unknown fields never fail decoding. When tracing is enabled each one is logged at `warn`
/// together with its value, and a decoding failure is logged with the JSON path that broke.
#[cfg(feature = "tracing")]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(type_name = %type_name::<T>(), json = %value, "decoding payload");

    let original = value.clone();
    let mut unknown: Vec<String> = Vec::new();

    let decoded: T = serde_ignored::deserialize(value, |path| unknown.push(path.to_string()))
        .inspect_err(|_| {
            let text = original.to_string();
            let de = &mut serde_json::Deserializer::from_str(&text);
            if let Err(err) = serde_path_to_error::deserialize::<_, T>(de) {
                let path = err.path().to_string();
                tracing::warn!(
                    type_name = %type_name::<T>(),
                    path = %path,
                    value = %describe(lookup(&original, &path)),
                    error = %err.inner(),
                    "payload decoding failed"
                );
            }
        })?;

    for path in unknown {
        tracing::warn!(
            type_name = %type_name::<T>(),
            field = %path,
            value = %describe(lookup(&original, &path)),
            "unknown field in gateway payload"
        );
    }

    Ok(decoded)
}

#[cfg(not(feature = "tracing"))]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Resolves a `serde_ignored` / `serde_path_to_error` path such as `data[2].bid` or `quotes.?.0`.
#[cfg(any(feature = "tracing", test))]
fn lookup<'value>(root: &'value Value, path: &str) -> Option<&'value Value> {
    segments(path).try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Splits on `.`, `[` and `]`, skipping empty segments and the `?` Option marker.
#[cfg(any(feature = "tracing", test))]
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['.', '[', ']'])
        .filter(|segment| !segment.is_empty() && *segment != "?")
}

#[cfg(any(feature = "tracing", test))]
fn describe(value: Option<&Value>) -> String {
    value.map_or_else(|| "<unable to retrieve>".to_owned(), Value::to_string)
}
