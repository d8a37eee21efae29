use serde_json::json;

use crate::call::history::CallHistory;
use crate::config::Config;
use crate::runtime;

/// Run one CLI verb against the local server's control API. Prints one JSON
/// document to stdout; the return value is the process exit code.
pub async fn run(verb: &str, args: &[String]) -> i32 {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => return fail(&format!("config error: {e}")),
    };

    match verb {
        "call" => {
            let Some(to) = args.first() else {
                return fail("usage: voice-bridge call <to> <prompt...> [--mode conversation] [--session-key KEY]");
            };
            let (flags, words) = split_flags(&args[1..]);
            if words.is_empty() {
                return fail("a prompt is required");
            }
            let mut body = json!({
                "to": to,
                "prompt": words.join(" "),
            });
            if let Some(mode) = flags.iter().find(|(k, _)| k == "mode").map(|(_, v)| v) {
                body["mode"] = json!(mode);
            }
            if let Some(key) = flags.iter().find(|(k, _)| k == "session-key").map(|(_, v)| v) {
                body["sessionKey"] = json!(key);
            }
            post(&config, "/api/call", body).await
        }
        "continue" => {
            let Some(call_id) = args.first() else {
                return fail("usage: voice-bridge continue <callId> <message...>");
            };
            let rest = &args[1..];
            if rest.is_empty() {
                return fail("a message is required");
            }
            post(
                &config,
                "/api/continue",
                json!({ "callId": call_id, "message": rest.join(" ") }),
            )
            .await
        }
        "speak" => {
            let Some(call_id) = args.first() else {
                return fail("usage: voice-bridge speak <callId> <text...>");
            };
            let rest = &args[1..];
            if rest.is_empty() {
                return fail("text is required");
            }
            post(
                &config,
                "/api/speak",
                json!({ "callId": call_id, "text": rest.join(" ") }),
            )
            .await
        }
        "end" => {
            let Some(call_id) = args.first() else {
                return fail("usage: voice-bridge end <callId>");
            };
            post(&config, "/api/end", json!({ "callId": call_id })).await
        }
        "status" => get(&config, "/api/status").await,
        "tail" => {
            let limit: usize = args
                .first()
                .and_then(|s| s.parse().ok())
                .unwrap_or(config.history.limit);
            let records = CallHistory::new(&config.history.path).read_last(limit);
            print_json(&json!({ "success": true, "calls": records }));
            0
        }
        "expose" => {
            let url = runtime::resolve_public_url(&config);
            print_json(&json!({
                "success": true,
                "publicUrl": url,
                "webhookUrl": format!("{url}{}", config.server.webhook_path),
            }));
            0
        }
        other => fail(&format!("unknown command: {other}")),
    }
}

async fn post(config: &Config, path: &str, body: serde_json::Value) -> i32 {
    request(config, path, Some(body)).await
}

async fn get(config: &Config, path: &str) -> i32 {
    request(config, path, None).await
}

async fn request(config: &Config, path: &str, body: Option<serde_json::Value>) -> i32 {
    let url = format!("{}{path}", config.local_url());
    let client = reqwest::Client::new();

    let builder = match body {
        Some(body) => client.post(&url).json(&body),
        None => client.get(&url),
    };

    let resp = builder
        .bearer_auth(&config.server.api_token)
        .timeout(std::time::Duration::from_secs(60))
        .send()
        .await;

    match resp {
        Ok(resp) => {
            let ok = resp.status().is_success();
            match resp.json::<serde_json::Value>().await {
                Ok(value) => {
                    print_json(&value);
                    if ok {
                        0
                    } else {
                        1
                    }
                }
                Err(e) => fail(&format!("invalid server response: {e}")),
            }
        }
        Err(e) => fail(&format!("server unreachable at {url}: {e}")),
    }
}

/// Split `--flag value` pairs from positional words.
fn split_flags(args: &[String]) -> (Vec<(String, String)>, Vec<String>) {
    let mut flags = Vec::new();
    let mut words = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if let Some(name) = args[i].strip_prefix("--") {
            if i + 1 < args.len() {
                flags.push((name.to_string(), args[i + 1].clone()));
                i += 2;
                continue;
            }
        }
        words.push(args[i].clone());
        i += 1;
    }
    (flags, words)
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn fail(message: &str) -> i32 {
    print_json(&json!({ "success": false, "error": message }));
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_split_from_words() {
        let args: Vec<String> = [
            "забронировать",
            "столик",
            "--mode",
            "conversation",
            "на",
            "вечер",
            "--session-key",
            "agent:main:telegram:dm:42",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let (flags, words) = split_flags(&args);
        assert_eq!(words, vec!["забронировать", "столик", "на", "вечер"]);
        assert_eq!(
            flags,
            vec![
                ("mode".to_string(), "conversation".to_string()),
                ("session-key".to_string(), "agent:main:telegram:dm:42".to_string()),
            ]
        );
    }

    #[test]
    fn trailing_flag_without_value_is_positional() {
        let args: Vec<String> = ["prompt", "--mode"].iter().map(|s| s.to_string()).collect();
        let (flags, words) = split_flags(&args);
        assert!(flags.is_empty());
        assert_eq!(words, vec!["prompt", "--mode"]);
    }
}
