//! CORS headers for endpoints with `cors_enabled`.

use switchyard_model::CorsSettings;

/// Headers added to every response of a CORS-enabled endpoint.
pub fn common_headers(cors: &CorsSettings) -> Vec<(String, String)> {
    let mut headers = vec![
        (
            "Access-Control-Allow-Origin".to_string(),
            cors.allow_origin.clone(),
        ),
        (
            "Access-Control-Request-Headers".to_string(),
            cors.request_headers.clone(),
        ),
        (
            "Access-Control-Allow-Headers".to_string(),
            cors.allow_headers.clone(),
        ),
        (
            "Access-Control-Max-Age".to_string(),
            cors.max_age.to_string(),
        ),
    ];
    if cors.allow_credentials {
        headers.push((
            "Access-Control-Allow-Credentials".to_string(),
            "true".to_string(),
        ));
    }
    headers
}

/// Headers answering a preflight request. `methods` are the methods
/// registered for the matched route's path.
pub fn preflight_headers(cors: &CorsSettings, methods: &[String]) -> Vec<(String, String)> {
    let mut headers = common_headers(cors);
    headers.push(("Access-Control-Allow-Methods".to_string(), methods.join(", ")));
    headers
}
