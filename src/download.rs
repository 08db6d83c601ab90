use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_URLS: [&str; 2] = [
    "https://zenodo.org/records/14949245/files/metadata.csv",
    "https://zenodo.org/records/14949245/files/imputed_goiener_v7.tar.zst",
];

/// Local file name for a download: the last path segment, spaces replaced.
pub fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .replace("%20", "_")
        .replace(' ', "_")
}

/// Downloads `url_str` into `dest_dir`, streaming the body to disk.
pub fn download_file(client: &Client, url_str: &str, dest_dir: &Path) -> Result<PathBuf> {
    let url = Url::parse(url_str).with_context(|| format!("Invalid URL {url_str}"))?;
    fs::create_dir_all(dest_dir)?;
    let dest_path = dest_dir.join(file_name_for(&url));
    info!("Saving {} to {}", url, dest_path.display());

    let response = client.get(url.as_str()).send()?.error_for_status()?;

    let pb = match response.content_length() {
        Some(len) => {
            let pb = ProgressBar::new(len);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let mut out = BufWriter::new(
        File::create(&dest_path).with_context(|| format!("Failed to create {}", dest_path.display()))?,
    );
    io::copy(&mut pb.wrap_read(response), &mut out)
        .with_context(|| format!("Failed to download {}", url))?;
    out.flush()?;
    pb.finish_and_clear();

    info!("Download complete: {}", dest_path.display());
    Ok(dest_path)
}
