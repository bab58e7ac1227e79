use std::time::Duration;

use crate::api::Problem;

pub(crate) type ReqResult<T> = std::result::Result<T, Problem>;

const TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(TIMEOUT)
        .timeout(TIMEOUT)
        .build()
        .unwrap_or_default()
}

pub(crate) async fn req_get(client: &reqwest::Client, url: &str) -> ReqResult<reqwest::Response> {
    log::trace!("GET {url}");
    client.get(url).send().await.map_err(transport_problem)
}

pub(crate) async fn req_head(client: &reqwest::Client, url: &str) -> ReqResult<reqwest::Response> {
    log::trace!("HEAD {url}");
    client.head(url).send().await.map_err(transport_problem)
}

pub(crate) async fn req_post(
    client: &reqwest::Client,
    url: &str,
    body: String,
) -> ReqResult<reqwest::Response> {
    log::trace!("POST {url} {body}");
    client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
        .body(body)
        .send()
        .await
        .map_err(transport_problem)
}

fn transport_problem(err: reqwest::Error) -> Problem {
    Problem {
        _type: "httpReqError".to_owned(),
        title: Some("HTTP request failed".to_owned()),
        description: Some(err.to_string()),
    }
}

pub(crate) async fn req_handle_error(res: reqwest::Response) -> ReqResult<reqwest::Response> {
    // ok responses pass through
    if res.status().is_success() {
        return Ok(res);
    }

    let status = res.status();
    let is_problem = req_expect_header(&res, "content-type")
        .is_ok_and(|ct| ct.starts_with("application/problem+json"));

    let body = req_safe_read_body(res).await;

    let problem = if is_problem {
        // if we were sent a problem+json, deserialize it
        serde_json::from_str(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".to_owned(),
            title: Some(format!("{status}")),
            description: Some(format!(
                "Failed to deserialize application/problem+json ({err}) body: {body}"
            )),
        })
    } else {
        // some other problem
        Problem {
            _type: "httpReqError".to_owned(),
            title: Some(format!("{status}")),
            description: Some(format!("body: {body}")),
        }
    };

    Err(problem)
}

pub(crate) fn req_expect_header(res: &reqwest::Response, name: &str) -> ReqResult<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Problem {
            _type: format!("Missing header: {name}"),
            title: None,
            description: None,
        })
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // a peer closing the connection abruptly should not lose what was already read
    res.text().await.unwrap_or_default()
}
