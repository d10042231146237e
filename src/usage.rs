use serde_json::Value;

/// Token counts reported by an upstream response. Providers disagree on
/// field names, so prompt/completion and input/output spellings are both
/// accepted and `total_tokens` is derived when absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservedUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

pub fn parse_usage(value: &Value) -> ObservedUsage {
    let mut usage = ObservedUsage::default();
    let Some(obj) = value.as_object() else {
        return usage;
    };
    usage.prompt_tokens = obj
        .get("prompt_tokens")
        .or_else(|| obj.get("input_tokens"))
        .and_then(Value::as_u64);
    usage.completion_tokens = obj
        .get("completion_tokens")
        .or_else(|| obj.get("output_tokens"))
        .and_then(Value::as_u64);
    usage.total_tokens = obj.get("total_tokens").and_then(Value::as_u64).or_else(|| {
        usage.prompt_tokens.and_then(|prompt| {
            usage
                .completion_tokens
                .map(|completion| prompt.saturating_add(completion))
        })
    });
    usage
}

/// Pull `usage.total_tokens` out of a buffered JSON response body.
pub fn total_tokens_from_body(body: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("usage")
        .map(parse_usage)
        .and_then(|usage| usage.total_tokens)
}
