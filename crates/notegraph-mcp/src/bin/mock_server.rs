//! A scriptable stdio MCP server used by the integration tests.
//!
//! Flags:
//!   --tag <s>               prefix for tool-call output (default "mock")
//!   --tools <a,b,...>       tool names to advertise
//!   --banner <text>         write this line to stderr at startup
//!   --fail-initialize <n>   answer the first n `initialize` calls with an error
//!   --ignore-tools-list     never answer `tools/list`
//!   --page-size <n>         paginate `tools/list` with this many tools per page
//!   --ask-client            after `notifications/initialized`, send the client a
//!                           `ping` and an unsupported request
//!   --slow-ms <n>           how long the `slow` tool takes (default 300)
//!   --fail-flaky <n>        answer the first n `mock/flaky` requests with an error
//!
//! `mock/flaky` answers `{"attempt": <k>}` once it stops failing.
//!
//! Tool behaviour on `tools/call`:
//!   hang    never answers
//!   fail    answers with `isError: true`
//!   image   answers with image content only
//!   crash   exits the process without answering
//!   pid     answers with this process id
//!   id      answers with the JSON-RPC id of the call
//!   slow    answers after `--slow-ms`
//!   replies answers with every response the client has sent us, as JSON
//!   other   answers with "<tag>:<name>" and the arguments as a second text part

use serde_json::{Value, json};
use std::io::{self, BufRead, Write};

struct Options {
    tag: String,
    tools: Vec<String>,
    banner: Option<String>,
    fail_initialize: u32,
    ignore_tools_list: bool,
    page_size: Option<usize>,
    ask_client: bool,
    slow_ms: u64,
    fail_flaky: u32,
}

fn parse_args() -> Options {
    let mut options = Options {
        tag: "mock".to_string(),
        tools: Vec::new(),
        banner: None,
        fail_initialize: 0,
        ignore_tools_list: false,
        page_size: None,
        ask_client: false,
        slow_ms: 300,
        fail_flaky: 0,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tag" => options.tag = args.next().unwrap_or_default(),
            "--tools" => {
                options.tools = args
                    .next()
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "--banner" => options.banner = args.next(),
            "--fail-initialize" => {
                options.fail_initialize = args.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            }
            "--ignore-tools-list" => options.ignore_tools_list = true,
            "--page-size" => options.page_size = args.next().and_then(|n| n.parse().ok()),
            "--ask-client" => options.ask_client = true,
            "--fail-flaky" => {
                options.fail_flaky = args.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            }
            "--slow-ms" => {
                options.slow_ms = args.next().and_then(|n| n.parse().ok()).unwrap_or(300);
            }
            other => eprintln!("mock-mcp-server: ignoring unknown flag {other}"),
        }
    }
    options
}

fn tool_entry(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Mock tool {name}"),
        "inputSchema": {"type": "object", "properties": {}}
    })
}

fn text(parts: &[String]) -> Value {
    let content: Vec<Value> = parts
        .iter()
        .map(|t| json!({"type": "text", "text": t}))
        .collect();
    json!({ "content": content })
}

fn main() {
    let options = parse_args();
    if let Some(banner) = &options.banner {
        eprintln!("{banner}");
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut initialize_calls = 0;
    let mut client_replies: Vec<Value> = Vec::new();
    let mut flaky_calls = 0;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-mcp-server: unparseable input {line}");
            continue;
        };
        let Some(method) = msg["method"].as_str().map(str::to_string) else {
            // A response to one of our own requests.
            client_replies.push(msg);
            continue;
        };
        let Some(id) = msg.get("id").cloned() else {
            if method == "notifications/initialized" && options.ask_client {
                let asks = [
                    json!({"jsonrpc": "2.0", "id": "srv-ping", "method": "ping"}),
                    json!({"jsonrpc": "2.0", "id": -1, "method": "sampling/createMessage", "params": {}}),
                ];
                for ask in asks {
                    if writeln!(stdout, "{ask}").and_then(|()| stdout.flush()).is_err() {
                        return;
                    }
                }
            }
            continue;
        };
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method.as_str() {
            "initialize" => {
                initialize_calls += 1;
                if initialize_calls <= options.fail_initialize {
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32603, "message": "not yet"}})
                } else {
                    json!({"jsonrpc": "2.0", "id": id, "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": options.tag, "version": "0.0.1"}
                    }})
                }
            }
            "tools/list" => {
                if options.ignore_tools_list {
                    continue;
                }
                let start: usize = params["cursor"]
                    .as_str()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                let size = options.page_size.unwrap_or(options.tools.len().max(1));
                let end = (start + size).min(options.tools.len());
                let tools: Vec<Value> = options.tools[start.min(end)..end]
                    .iter()
                    .map(|n| tool_entry(n))
                    .collect();
                let mut result = json!({ "tools": tools });
                if end < options.tools.len() {
                    result["nextCursor"] = json!(end.to_string());
                }
                json!({"jsonrpc": "2.0", "id": id, "result": result})
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let result = match name.as_str() {
                    "hang" => continue,
                    "crash" => std::process::exit(3),
                    "fail" => {
                        let mut r = text(&["boom".to_string()]);
                        r["isError"] = json!(true);
                        r
                    }
                    "image" => json!({"content": [{"type": "image", "data": "AAAA", "mimeType": "image/png"}]}),
                    "pid" => text(&[std::process::id().to_string()]),
                    "id" => text(&[id.to_string()]),
                    "slow" => {
                        std::thread::sleep(std::time::Duration::from_millis(options.slow_ms));
                        text(&["slow".to_string()])
                    }
                    "replies" => text(&[Value::Array(client_replies.clone()).to_string()]),
                    _ => text(&[
                        format!("{}:{}", options.tag, name),
                        params["arguments"].to_string(),
                    ]),
                };
                json!({"jsonrpc": "2.0", "id": id, "result": result})
            }
            "mock/flaky" => {
                flaky_calls += 1;
                if flaky_calls <= options.fail_flaky {
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32603, "message": "flaky"}})
                } else {
                    json!({"jsonrpc": "2.0", "id": id, "result": {"attempt": flaky_calls}})
                }
            }
            _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}),
        };

        if writeln!(stdout, "{reply}").and_then(|()| stdout.flush()).is_err() {
            break;
        }
    }
}
