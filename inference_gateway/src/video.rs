use std::{fmt, path::PathBuf};
use thiserror::Error;
use tonic::async_trait;

#[derive(Error, Debug)]
pub enum VideoRepositoryError {
    #[error("video {0} not found")]
    NotFound(FullVideoId),
    #[error("invalid identifier `{0}`")]
    InvalidId(String),
    #[error("failed to read video storage: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullVideoId {
    pub organization_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub dataset_id: String,
    pub video_id: String,
}

impl FullVideoId {
    fn segments(&self) -> [&str; 5] {
        [
            &self.organization_id,
            &self.workspace_id,
            &self.project_id,
            &self.dataset_id,
            &self.video_id,
        ]
    }
}

impl fmt::Display for FullVideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments().join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDescriptor {
    pub id: FullVideoId,
    pub file_path: PathBuf,
}

#[async_trait]
pub trait VideoRepository: Send + Sync + 'static {
    async fn load_video_by_id(
        &self,
        id: &FullVideoId,
    ) -> Result<VideoDescriptor, VideoRepositoryError>;
}

/// Videos laid out as `<root>/<org>/<workspace>/<project>/<dataset>/<video>/<file>`.
#[derive(Debug, Clone)]
pub struct FsVideoRepository {
    root: PathBuf,
}

impl FsVideoRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn video_dir(&self, id: &FullVideoId) -> Result<PathBuf, VideoRepositoryError> {
        let mut dir = self.root.clone();
        for segment in id.segments() {
            if segment.is_empty() || segment.contains(['/', '\\']) || segment == ".." {
                return Err(VideoRepositoryError::InvalidId(segment.to_string()));
            }
            dir.push(segment);
        }
        Ok(dir)
    }
}

#[async_trait]
impl VideoRepository for FsVideoRepository {
    async fn load_video_by_id(
        &self,
        id: &FullVideoId,
    ) -> Result<VideoDescriptor, VideoRepositoryError> {
        let dir = self.video_dir(id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VideoRepositoryError::NotFound(id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        let file_path = pick_video_file(&candidates)
            .ok_or_else(|| VideoRepositoryError::NotFound(id.clone()))?;
        tracing::debug!("Resolved video {} to {:?}", id, file_path);

        Ok(VideoDescriptor {
            id: id.clone(),
            file_path,
        })
    }
}

fn pick_video_file(candidates: &[PathBuf]) -> Option<PathBuf> {
    let is_named_video = |path: &&PathBuf| {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem == "video")
    };

    candidates
        .iter()
        .find(is_named_video)
        .or(match candidates {
            [only] => Some(only),
            _ => None,
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_id() -> FullVideoId {
        FullVideoId {
            organization_id: "org".to_string(),
            workspace_id: "ws".to_string(),
            project_id: "project".to_string(),
            dataset_id: "dataset".to_string(),
            video_id: "video-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_load_single_file() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("org/ws/project/dataset/video-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("clip.mp4"), b"data").unwrap();

        let repo = FsVideoRepository::new(root.path());
        let video = repo.load_video_by_id(&video_id()).await.unwrap();

        assert_eq!(video.file_path, dir.join("clip.mp4"));
        assert_eq!(video.id, video_id());
    }

    #[tokio::test]
    async fn test_prefers_video_named_file() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("org/ws/project/dataset/video-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("thumbnail.jpg"), b"thumb").unwrap();
        std::fs::write(dir.join("video.mp4"), b"data").unwrap();

        let repo = FsVideoRepository::new(root.path());
        let video = repo.load_video_by_id(&video_id()).await.unwrap();

        assert_eq!(video.file_path, dir.join("video.mp4"));
    }

    #[tokio::test]
    async fn test_missing_video() {
        let root = tempfile::tempdir().unwrap();
        let repo = FsVideoRepository::new(root.path());

        let result = repo.load_video_by_id(&video_id()).await;
        assert!(matches!(result, Err(VideoRepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let root = tempfile::tempdir().unwrap();
        let repo = FsVideoRepository::new(root.path());
        let mut id = video_id();
        id.dataset_id = "..".to_string();

        let result = repo.load_video_by_id(&id).await;
        assert!(matches!(result, Err(VideoRepositoryError::InvalidId(_))));
    }
}
