use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::GenerateError;
use crate::storage::channel::Channel;
use crate::storage::task::Task;

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(rename = "inlineData")]
    inline_data: Option<InlineData>,
    #[serde(rename = "fileData")]
    file_data: Option<FileData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct FileData {
    #[serde(rename = "fileUri", default)]
    file_uri: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

pub(crate) fn endpoint(base_url: &str, model_id: &str) -> String {
    format!("{}/v1beta/models/{}:generateContent", base_url, model_id)
}

/// A single `contents.parts` array: prompt text first, reference image
/// appended as `fileData` (URL) or `inlineData` (base64 payloads).
pub(crate) fn build_body(task: &Task) -> Value {
    let mut parts = vec![json!({ "text": task.prompt })];
    if !task.reference_image.is_empty() {
        parts.push(reference_part(&task.reference_image));
    }

    let mut body = json!({ "contents": [{ "parts": parts }] });

    let mut image_config = Map::new();
    if !task.resolution.is_empty() {
        image_config.insert("resolution".to_string(), json!(task.resolution));
    }
    if !task.aspect_ratio.is_empty() {
        image_config.insert("aspectRatio".to_string(), json!(task.aspect_ratio));
    }
    if task.count > 1 {
        image_config.insert("numberOfImages".to_string(), json!(task.count));
    }
    if !image_config.is_empty() {
        body["generationConfig"] = json!({ "imageConfig": image_config });
    }
    body
}

fn reference_part(reference: &str) -> Value {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return json!({ "fileData": { "fileUri": reference } });
    }

    // Data-URL: MIME from the prefix, payload after the first comma.
    // Anything else is raw base64, assumed PNG.
    let (mime_type, data) = match reference.strip_prefix("data:") {
        Some(rest) => match rest.split_once(',') {
            Some((header, payload)) => {
                let mime = header.split(';').next().unwrap_or_default();
                let mime = if mime.is_empty() { "image/png" } else { mime };
                (mime.to_string(), payload.to_string())
            }
            None => ("image/png".to_string(), rest.to_string()),
        },
        None => ("image/png".to_string(), reference.to_string()),
    };

    json!({ "inlineData": { "mimeType": mime_type, "data": data } })
}

pub(crate) fn parse_response(body: &str) -> Result<Vec<String>, GenerateError> {
    let response: GenerateContentResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(GenerateError::Api(error.message));
    }

    let mut image_urls = Vec::new();
    for candidate in response.candidates {
        for part in candidate.content.parts {
            if let Some(inline) = part.inline_data {
                if !inline.data.is_empty() {
                    let mime = if inline.mime_type.is_empty() {
                        "image/png"
                    } else {
                        &inline.mime_type
                    };
                    image_urls.push(format!("data:{};base64,{}", mime, inline.data));
                }
            } else if let Some(file) = part.file_data {
                if !file.file_uri.is_empty() {
                    image_urls.push(file.file_uri);
                }
            }
        }
    }
    if image_urls.is_empty() {
        return Err(GenerateError::NoImages);
    }
    Ok(image_urls)
}

pub(crate) async fn generate(
    http: &reqwest::Client,
    channel: &Channel,
    api_key: &str,
    task: &Task,
) -> Result<Vec<String>, GenerateError> {
    let endpoint = endpoint(channel.base_url_or_default(), &task.model_id);
    let body = build_body(task);

    let response = http
        .post(&endpoint)
        .header("x-goog-api-key", api_key)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(GenerateError::Status {
            code: status.as_u16(),
            body: text,
        });
    }
    parse_response(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_model() {
        assert_eq!(
            endpoint("https://generativelanguage.googleapis.com", "img-pro"),
            "https://generativelanguage.googleapis.com/v1beta/models/img-pro:generateContent"
        );
    }

    #[test]
    fn body_starts_with_prompt_text() {
        let task = Task::new(1, "img-pro", "a red bicycle");
        let body = build_body(&task);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a red bicycle");
        let config = &body["generationConfig"]["imageConfig"];
        assert_eq!(config["resolution"], "1K");
        assert_eq!(config["aspectRatio"], "1:1");
        assert!(config.get("numberOfImages").is_none());
    }

    #[test]
    fn count_above_one_sets_number_of_images() {
        let mut task = Task::new(1, "img-pro", "a red bicycle");
        task.count = 3;
        let body = build_body(&task);
        assert_eq!(
            body["generationConfig"]["imageConfig"]["numberOfImages"],
            3
        );
    }

    #[test]
    fn url_reference_becomes_file_data() {
        let mut task = Task::new(1, "img-pro", "p");
        task.reference_image = "https://cdn.example.com/ref.png".to_string();
        let body = build_body(&task);
        assert_eq!(
            body["contents"][0]["parts"][1]["fileData"]["fileUri"],
            "https://cdn.example.com/ref.png"
        );
    }

    #[test]
    fn data_url_reference_splits_mime_and_payload() {
        let mut task = Task::new(1, "img-pro", "p");
        task.reference_image = "data:image/jpeg;base64,aGVsbG8=".to_string();
        let body = build_body(&task);
        let part = &body["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(part["mimeType"], "image/jpeg");
        assert_eq!(part["data"], "aGVsbG8=");
    }

    #[test]
    fn raw_base64_reference_defaults_to_png() {
        let mut task = Task::new(1, "img-pro", "p");
        task.reference_image = "aGVsbG8=".to_string();
        let body = build_body(&task);
        let part = &body["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(part["mimeType"], "image/png");
        assert_eq!(part["data"], "aGVsbG8=");
    }

    #[test]
    fn response_walk_emits_data_urls_and_file_uris() {
        let body = r#"{
            "candidates": [{
                "content": {
                    "parts": [
                        {"inlineData": {"mimeType": "image/webp", "data": "Zm9v"}},
                        {"fileData": {"fileUri": "https://files/abc"}}
                    ]
                }
            }]
        }"#;
        let urls = parse_response(body).unwrap();
        assert_eq!(
            urls,
            vec![
                "data:image/webp;base64,Zm9v".to_string(),
                "https://files/abc".to_string()
            ]
        );
    }

    #[test]
    fn empty_candidates_is_an_error() {
        let err = parse_response(r#"{"candidates":[]}"#).unwrap_err();
        assert!(matches!(err, GenerateError::NoImages));
    }

    #[test]
    fn api_error_is_surfaced() {
        let err = parse_response(r#"{"error":{"message":"API key not valid","code":400}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("API key not valid"));
    }
}
