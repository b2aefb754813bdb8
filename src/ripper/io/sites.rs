use std::fs::read_to_string;
use std::path::Path;

use crate::ripper::io::{ConfigError, ConfigResult};

/// Characters separating site names in the sites file.
const SITE_SEPARATORS: [char; 5] = [',', ' ', '\t', '\r', '\n'];

/// Help text shown when there is nothing to download.
pub(crate) const USAGE: &str = "\
1. Create the sites file next to the executable (sites.txt by default).
2. List tumblr sites in it separated by comma, space, tab or newline.
3. Save the file and retry.

Sample file content:
site1,site2

Or pass the sites on the command line:
tumblr_ripper site1,site2";

/// Splits the contents of a sites file into site names. Blank entries are
/// dropped; duplicates and order are kept.
pub(crate) fn parse_sites(contents: &str) -> Vec<String> {
    contents
        .split(&SITE_SEPARATORS[..])
        .map(str::trim)
        .filter(|site| !site.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits the comma separated command line argument.
pub(crate) fn parse_site_arg(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(str::trim)
        .filter(|site| !site.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads the sites file at `path`.
pub(crate) fn read_sites_file(path: &Path) -> ConfigResult<Vec<String>> {
    if !path.exists() {
        return Err(ConfigError::NoSites(format!("{} does not exist.", path.display())));
    }

    let sites = parse_sites(&read_to_string(path)?);
    if sites.is_empty() {
        return Err(ConfigError::NoSites(format!("{} lists no sites.", path.display())));
    }

    trace!("Read {} sites from {}", sites.len(), path.display());
    Ok(sites)
}

/// Sites from the command line argument when given, otherwise from the sites file.
pub(crate) fn collect_sites(arg: Option<&str>, sites_file: &Path) -> ConfigResult<Vec<String>> {
    match arg {
        Some(arg) => {
            let sites = parse_site_arg(arg);
            if sites.is_empty() {
                Err(ConfigError::NoSites("The site argument is empty.".to_string()))
            } else {
                Ok(sites)
            }
        }
        None => read_sites_file(sites_file),
    }
}
