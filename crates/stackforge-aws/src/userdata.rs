//! Built-in bootstrap scripts
//!
//! Every instance boots with the dependency token of its `dependsOn`
//! written to disk, so software on the host can find the resources it
//! was wired to. Rendered scripts are template values: references inside
//! the token stay `Fn::Join` parts until deploy time.

use serde_json::{Value, json};
use stackforge_core::stack::join;

/// Linux bootstrap script
pub const LINUX_BOOTSTRAP: &str = r#"#!/bin/bash
set -e

mkdir -p /etc/stackforge
cat > /etc/stackforge/dependencies.json <<'STACKFORGE_EOF'
{{magicToken}}
STACKFORGE_EOF

echo "stackforge: {{instanceId}} ready in {{stackName}}"
"#;

/// Windows bootstrap script
pub const WINDOWS_BOOTSTRAP: &str = r#"<powershell>
New-Item -ItemType Directory -Force -Path C:\ProgramData\Stackforge | Out-Null
@'
{{magicToken}}
'@ | Set-Content -Path C:\ProgramData\Stackforge\dependencies.json
Write-Output "stackforge: {{instanceId}} ready in {{stackName}}"
</powershell>
"#;

const MIME_BOUNDARY: &str = "==BOUNDARY==";

/// Get the bootstrap script for an OS type (`linux` unless `windows`)
pub fn get_builtin_script(os_type: &str) -> &'static str {
    if os_type.eq_ignore_ascii_case("windows") {
        WINDOWS_BOOTSTRAP
    } else {
        LINUX_BOOTSTRAP
    }
}

/// Values substituted into a bootstrap script
#[derive(Debug, Clone, Default)]
pub struct UserData<'a> {
    pub os_type: &'a str,
    pub instance_id: &'a str,
    pub stack_name: &'a str,
    /// Token string or `Fn::Join` expression; null or empty renders `{}`
    pub magic_token: Value,
}

impl UserData<'_> {
    pub fn render(&self) -> Value {
        let token = match &self.magic_token {
            Value::Null => Value::String("{}".into()),
            Value::String(text) if text.is_empty() => Value::String("{}".into()),
            token => token.clone(),
        };
        let script = get_builtin_script(self.os_type)
            .replace("{{instanceId}}", self.instance_id)
            .replace("{{stackName}}", self.stack_name);

        let mut parts = Vec::new();
        for (i, piece) in script.split("{{magicToken}}").enumerate() {
            if i > 0 {
                parts.push(token.clone());
            }
            parts.push(Value::String(piece.to_string()));
        }
        join(parts)
    }

    /// Multipart form expected by launch templates of managed compute environments
    pub fn render_multipart(&self) -> Value {
        join([
            Value::String(format!(
                "Content-Type: multipart/mixed; boundary=\"{b}\"\n\n--{b}\nContent-Type: text/x-shellscript\n\n",
                b = MIME_BOUNDARY
            )),
            self.render(),
            Value::String(format!("\n--{}--", MIME_BOUNDARY)),
        ])
    }
}

/// Template value for a user data property
pub fn base64_value(script: Value) -> Value {
    json!({ "Fn::Base64": script })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_embeds_token() {
        let rendered = UserData {
            os_type: "linux",
            instance_id: "web.1",
            stack_name: "demo",
            magic_token: json!(r#"{"dependencies":{}}"#),
        }
        .render();

        let rendered = rendered.as_str().unwrap();
        assert!(rendered.starts_with("#!/bin/bash"));
        assert!(rendered.contains(r#"{"dependencies":{}}"#));
        assert!(rendered.contains("web.1 ready in demo"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn test_render_splices_references() {
        let token = json!({ "Fn::Join": ["", [
            r#"{"dependencies":{"EFS:shared":{"properties":{"fileSystemId":""#,
            { "Ref": "FileSystemShared" },
            r#""}}}}"#
        ]] });
        let rendered = UserData {
            os_type: "linux",
            instance_id: "web",
            stack_name: "demo",
            magic_token: token,
        }
        .render();

        let parts = rendered["Fn::Join"][1].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].as_str().unwrap().starts_with("#!/bin/bash"));
        assert!(parts[0].as_str().unwrap().ends_with(r#""fileSystemId":""#));
        assert_eq!(parts[1], json!({ "Ref": "FileSystemShared" }));
        assert!(parts[2].as_str().unwrap().contains("web ready in demo"));

        let encoded = base64_value(rendered.clone());
        assert_eq!(encoded["Fn::Base64"], rendered);
    }

    #[test]
    fn test_windows_and_empty_token() {
        let rendered = UserData {
            os_type: "Windows",
            ..Default::default()
        }
        .render();
        let rendered = rendered.as_str().unwrap();
        assert!(rendered.starts_with("<powershell>"));
        assert!(rendered.contains("\n{}\n"));
    }

    #[test]
    fn test_multipart() {
        let rendered = UserData::default().render_multipart();
        let rendered = rendered.as_str().unwrap();
        assert!(rendered.starts_with("Content-Type: multipart/mixed"));
        assert!(rendered.contains("#!/bin/bash"));
        assert!(rendered.ends_with("--==BOUNDARY==--"));
    }

    #[test]
    fn test_multipart_keeps_references() {
        let rendered = UserData {
            magic_token: json!({ "Fn::Join": ["", ["{", { "Ref": "Db" }, "}"]] }),
            ..Default::default()
        }
        .render_multipart();

        let parts = rendered["Fn::Join"][1].as_array().unwrap();
        assert!(parts[0].as_str().unwrap().starts_with("Content-Type: multipart/mixed"));
        assert_eq!(parts[1], json!({ "Ref": "Db" }));
        assert!(parts[2].as_str().unwrap().ends_with("--==BOUNDARY==--"));
    }
}
