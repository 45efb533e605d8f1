/// Share to connect for `path`: the `\\server\share` root of a UNC path,
/// or the path unchanged when it is not UNC.
pub fn share_root(path: &str) -> String {
    let trimmed = path.trim();
    let Some(rest) = trimmed
        .strip_prefix(r"\\")
        .or_else(|| trimmed.strip_prefix("//"))
    else {
        return trimmed.to_string();
    };

    let mut parts = rest.split(['\\', '/']).filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some(server), Some(share)) => format!(r"\\{server}\{share}"),
        _ => trimmed.to_string(),
    }
}
