//! Chromium-family executable discovery.

use std::path::{Path, PathBuf};

fn unix_candidates() -> &'static [&'static str] {
	&[
		"google-chrome-stable",
		"google-chrome",
		"chromium-browser",
		"chromium",
		"brave-browser",
		"/usr/bin/google-chrome-stable",
		"/usr/bin/google-chrome",
		"/usr/bin/chromium-browser",
		"/usr/bin/chromium",
		"/snap/bin/chromium",
	]
}

fn macos_candidates() -> &'static [&'static str] {
	&[
		"/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
		"/Applications/Chromium.app/Contents/MacOS/Chromium",
		"/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
	]
}

fn windows_candidates() -> Vec<String> {
	let mut roots: Vec<PathBuf> = ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
		.into_iter()
		.filter_map(|key| std::env::var(key).ok())
		.map(PathBuf::from)
		.collect();
	if roots.is_empty() {
		roots.push(PathBuf::from(r"C:\Program Files"));
	}

	let mut candidates = Vec::new();
	for root in roots {
		for suffix in [["Google", "Chrome", "Application", "chrome.exe"], ["Microsoft", "Edge", "Application", "msedge.exe"]] {
			let path: PathBuf = suffix.iter().fold(root.clone(), |path, part| path.join(part));
			candidates.push(path.to_string_lossy().into_owned());
		}
	}
	candidates.extend(["chrome.exe".to_string(), "msedge.exe".to_string()]);
	candidates
}

fn platform_candidates() -> Vec<String> {
	if cfg!(target_os = "macos") {
		macos_candidates().iter().map(|c| c.to_string()).collect()
	} else if cfg!(target_os = "windows") {
		windows_candidates()
	} else {
		unix_candidates().iter().map(|c| c.to_string()).collect()
	}
}

/// First candidate that exists: absolute paths are checked on disk, bare
/// names are resolved through `PATH`.
pub fn resolve(candidates: &[String]) -> Option<PathBuf> {
	candidates.iter().find_map(|candidate| {
		let path = Path::new(candidate);
		if path.is_absolute() {
			path.exists().then(|| path.to_path_buf())
		} else {
			which::which(candidate).ok()
		}
	})
}

pub fn find_browser() -> Option<PathBuf> {
	resolve(&platform_candidates())
}
