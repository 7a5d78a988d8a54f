use eyre::WrapErr as _;

use crate::client::api::Problem;

pub(crate) type ReqResult<T> = std::result::Result<T, Problem>;

pub(crate) async fn req_get(http: &reqwest::Client, url: &str) -> eyre::Result<reqwest::Response> {
    log::trace!("GET {url}");
    http.get(url)
        .send()
        .await
        .wrap_err_with(|| format!("GET {url}"))
}

pub(crate) async fn req_head(http: &reqwest::Client, url: &str) -> eyre::Result<reqwest::Response> {
    log::trace!("HEAD {url}");
    http.head(url)
        .send()
        .await
        .wrap_err_with(|| format!("HEAD {url}"))
}

pub(crate) async fn req_post(
    http: &reqwest::Client,
    url: &str,
    body: String,
) -> eyre::Result<reqwest::Response> {
    log::trace!("POST {url} {body}");
    http.post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
        .body(body)
        .send()
        .await
        .wrap_err_with(|| format!("POST {url}"))
}

/// Turns non-2xx responses into a [`Problem`].
pub(crate) async fn req_handle_error(res: reqwest::Response) -> ReqResult<reqwest::Response> {
    // ok responses pass through
    if res.status().is_success() {
        return Ok(res);
    }

    let status = res.status();
    let is_problem = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/problem+json"));

    // the CA sometimes closes the connection abruptly after sending the body
    let body = res.text().await.unwrap_or_default();

    let problem = if is_problem {
        serde_json::from_str(&body).unwrap_or_else(|err| {
            Problem::new(
                "problemJsonFail",
                Some(format!(
                    "Failed to deserialize application/problem+json ({err}) body: {body}"
                )),
            )
        })
    } else {
        Problem::new("httpReqError", Some(format!("{status} body: {body}")))
    };

    Err(problem)
}

pub(crate) fn req_expect_header(res: &reqwest::Response, name: &str) -> ReqResult<String> {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Problem::new(format!("Missing header: {name}"), None))
}
