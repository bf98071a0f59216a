use quick_xml::events::Event;
use quick_xml::Reader;

use crate::archive::ArchiveError;
use crate::registry::normalize_version;

/// Package identity read from a `.nuspec` manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageIdentity {
    pub id: String,
    pub version: String,
}

/// The identity field the element at `path` holds, if any.
fn metadata_field<'a>(
    path: &[String],
    id: &'a mut Option<String>,
    version: &'a mut Option<String>,
) -> Option<&'a mut Option<String>> {
    if path.len() != 3 || path[0] != "package" || path[1] != "metadata" {
        return None;
    }
    match path[2].as_str() {
        "id" => Some(id),
        "version" => Some(version),
        _ => None,
    }
}

/// Extract `<metadata><id>` and `<metadata><version>` from a nuspec.
///
/// The version is returned in normalized form.
pub fn parse_identity(xml: &str) -> Result<PackageIdentity, ArchiveError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut id = None;
    let mut version = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                if let Some(field) = metadata_field(&path, &mut id, &mut version) {
                    let text = t
                        .unescape()
                        .map_err(|e| ArchiveError::Manifest(format!("bad nuspec text: {}", e)))?;
                    *field = Some(text.trim().to_string());
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(field) = metadata_field(&path, &mut id, &mut version) {
                    let text = String::from_utf8(t.into_inner().into_owned())
                        .map_err(|_| ArchiveError::Manifest("nuspec CDATA is not utf-8".into()))?;
                    *field = Some(text.trim().to_string());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ArchiveError::Manifest(format!(
                    "nuspec is not valid xml at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    let id = id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ArchiveError::Manifest("nuspec has no package id".to_string()))?;
    let raw_version = version
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ArchiveError::Manifest("nuspec has no package version".to_string()))?;
    let version = normalize_version(&raw_version).ok_or_else(|| {
        ArchiveError::Manifest(format!("invalid package version {:?}", raw_version))
    })?;

    Ok(PackageIdentity { id, version })
}
