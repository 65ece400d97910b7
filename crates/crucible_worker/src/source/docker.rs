//! Docker Hub reference resolution.

/// Turn a Docker Hub URL into a pullable image name; plain references pass
/// through untouched.
///
/// - `https://hub.docker.com/r/username/repo` -> `username/repo`
/// - `https://hub.docker.com/_/nginx` -> `nginx`
/// - `nginx:latest` -> `nginx:latest`
pub fn resolve_image_reference(reference: &str) -> String {
    if !reference.starts_with("http") {
        return reference.to_string();
    }

    let rest = match reference.split_once("://") {
        Some((_scheme, rest)) => rest,
        None => return reference.to_string(),
    };
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let path = path.trim_matches('/');

    if host == "hub.docker.com" {
        let segments: Vec<&str> = path.split('/').collect();
        match segments.as_slice() {
            // user repository: hub.docker.com/r/username/repo[/...]
            ["r", user, repo, ..] => return format!("{user}/{repo}"),
            // official repository: hub.docker.com/_/repo[/...]
            ["_", repo, ..] => return (*repo).to_string(),
            _ => {}
        }
    }

    path.to_string()
}
