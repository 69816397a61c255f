use crate::pose::Pose;

/// Content type every scan photo is stored with.
pub const PHOTO_CONTENT_TYPE: &str = "image/jpeg";

/// Storage path for one pose photo of a scan.
///
/// Format: `user_uploads/{uid}/scans/{scan_id}/{pose}.jpg`
///
/// Deterministic for a given `(uid, scan_id, pose)`, so a re-submitted scan
/// overwrites its earlier photos instead of leaving orphans behind.
pub fn build_scan_photo_path(uid: &str, scan_id: &str, pose: Pose) -> String {
    format!(
        "user_uploads/{uid}/scans/{scan_id}/{pose}.jpg",
        uid = sanitize_path_component(uid),
        scan_id = sanitize_path_component(scan_id),
        pose = pose.as_str(),
    )
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
