use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{json, Value};

use super::GenerateError;
use crate::storage::channel::Channel;
use crate::storage::task::Task;

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageItem>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    #[serde(default)]
    url: String,
    #[serde(default)]
    b64_json: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// OpenAI image API: `/v1/images/edits` when a reference image is present,
/// `/v1/images/generations` otherwise.
pub(crate) fn build_request(base_url: &str, task: &Task) -> (String, Value) {
    let mut body = json!({
        "prompt": task.prompt,
        "model": task.model_id,
        "n": task.count,
    });
    if !task.resolution.is_empty() {
        body["size"] = json!(task.resolution);
    }
    if !task.aspect_ratio.is_empty() {
        body["aspect_ratio"] = json!(task.aspect_ratio);
    }

    let endpoint = if task.reference_image.is_empty() {
        format!("{}/v1/images/generations", base_url)
    } else {
        body["image"] = json!(task.reference_image);
        format!("{}/v1/images/edits", base_url)
    };
    (endpoint, body)
}

pub(crate) fn parse_response(body: &str) -> Result<Vec<String>, GenerateError> {
    let response: ImagesResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(GenerateError::Api(error.message));
    }

    let mut image_urls = Vec::new();
    for item in response.data {
        if !item.url.is_empty() {
            image_urls.push(item.url);
        } else if !item.b64_json.is_empty() {
            image_urls.push(format!("data:image/png;base64,{}", item.b64_json));
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
    let (endpoint, body) = build_request(channel.base_url_or_default(), task);

    let response = http
        .post(&endpoint)
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
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

    fn task() -> Task {
        let mut task = Task::new(1, "img-1", "a cat in a hat");
        task.count = 2;
        task
    }

    #[test]
    fn generation_request_shape() {
        let (endpoint, body) = build_request("https://api.openai.com", &task());
        assert_eq!(endpoint, "https://api.openai.com/v1/images/generations");
        assert_eq!(body["prompt"], "a cat in a hat");
        assert_eq!(body["model"], "img-1");
        assert_eq!(body["n"], 2);
        assert_eq!(body["size"], "1K");
        assert_eq!(body["aspect_ratio"], "1:1");
        assert!(body.get("image").is_none());
    }

    #[test]
    fn reference_image_switches_to_edits() {
        let mut task = task();
        task.reference_image = "data:image/png;base64,AAAA".to_string();
        let (endpoint, body) = build_request("https://api.openai.com", &task);
        assert_eq!(endpoint, "https://api.openai.com/v1/images/edits");
        assert_eq!(body["image"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn parses_urls_and_wraps_base64() {
        let body = r#"{"data":[{"url":"https://x/1.png"},{"b64_json":"Zm9v"}]}"#;
        let urls = parse_response(body).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://x/1.png".to_string(),
                "data:image/png;base64,Zm9v".to_string()
            ]
        );
    }

    #[test]
    fn api_error_field_wins() {
        let body = r#"{"data":[],"error":{"message":"billing hard limit reached"}}"#;
        let err = parse_response(body).unwrap_err();
        assert!(matches!(err, GenerateError::Api(_)));
        assert!(err.to_string().contains("billing hard limit"));
    }

    #[test]
    fn empty_data_is_an_error() {
        let err = parse_response(r#"{"data":[]}"#).unwrap_err();
        assert!(matches!(err, GenerateError::NoImages));
    }
}
