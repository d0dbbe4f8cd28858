use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::api::{self, ApiError, Cursor, LikeOutcome, Page, Post, PostId};

/// Remote operations the feed controller needs. Implementations block; the
/// controller calls them from worker threads.
pub trait PostService: Send + Sync {
    fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Post>, ApiError>;
    fn create_post(&self, content: &str) -> Result<Post, ApiError>;
    fn toggle_like(&self, id: PostId) -> Result<LikeOutcome, ApiError>;
    fn delete_post(&self, id: PostId) -> Result<(), ApiError>;
    fn update_post(&self, id: PostId, content: &str) -> Result<Post, ApiError>;
}

pub struct ApiPostService {
    client: Arc<api::Client>,
}

impl ApiPostService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl PostService for ApiPostService {
    fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Post>, ApiError> {
        self.client.posts(cursor)
    }

    fn create_post(&self, content: &str) -> Result<Post, ApiError> {
        self.client.create_post(content)
    }

    fn toggle_like(&self, id: PostId) -> Result<LikeOutcome, ApiError> {
        self.client.toggle_like(id)
    }

    fn delete_post(&self, id: PostId) -> Result<(), ApiError> {
        self.client.delete_post(id)
    }

    fn update_post(&self, id: PostId, content: &str) -> Result<Post, ApiError> {
        self.client.update_post(id, content)
    }
}

/// In-memory feed served newest-first in numbered pages.
///
/// Pages are plain offsets, so creating a post shifts later pages by one and a
/// follow-up fetch overlaps what the caller already holds.
pub struct MockPostService {
    state: Mutex<MockState>,
    page_size: usize,
}

struct MockState {
    posts: Vec<Post>,
    next_id: u64,
}

impl Default for MockPostService {
    fn default() -> Self {
        Self::with_posts(sample_posts(), 3)
    }
}

impl MockPostService {
    pub fn with_posts(posts: Vec<Post>, page_size: usize) -> Self {
        let next_id = posts.iter().map(|post| post.id.0).max().unwrap_or(0) + 1;
        Self {
            state: Mutex::new(MockState { posts, next_id }),
            page_size: page_size.max(1),
        }
    }

    pub fn posts(&self) -> Vec<Post> {
        self.state.lock().posts.clone()
    }
}

impl PostService for MockPostService {
    fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Post>, ApiError> {
        let page = match cursor {
            Cursor::Start => 1,
            Cursor::Next(token) => token
                .parse::<usize>()
                .ok()
                .filter(|page| *page > 0)
                .ok_or_else(|| ApiError::Validation(format!("invalid page {token:?}")))?,
            Cursor::Exhausted => return Ok(Page::default()),
        };
        let state = self.state.lock();
        let total = state.posts.len();
        let start = (page - 1)
            .checked_mul(self.page_size)
            .ok_or_else(|| ApiError::Validation(format!("page {page} is out of range")))?;
        if start >= total && page > 1 {
            return Err(ApiError::NotFound);
        }
        let end = (start + self.page_size).min(total);
        Ok(Page {
            count: Some(total as u64),
            next: (end < total).then(|| (page + 1).to_string()),
            previous: (page > 1).then(|| (page - 1).to_string()),
            results: state.posts[start..end].to_vec(),
        })
    }

    fn create_post(&self, content: &str) -> Result<Post, ApiError> {
        if content.trim().is_empty() {
            return Err(ApiError::Validation("content: This field may not be blank.".into()));
        }
        let mut state = self.state.lock();
        let now = Utc::now();
        let post = Post {
            id: PostId(state.next_id),
            owner: Some(1),
            owner_username: "you".into(),
            owner_profile_image: None,
            content: content.to_string(),
            is_owner: true,
            is_liked: false,
            likes_count: 0,
            created_at: Some(now),
            updated_at: Some(now),
        };
        state.next_id += 1;
        state.posts.insert(0, post.clone());
        Ok(post)
    }

    fn toggle_like(&self, id: PostId) -> Result<LikeOutcome, ApiError> {
        let mut state = self.state.lock();
        let post = state
            .posts
            .iter_mut()
            .find(|post| post.id == id)
            .ok_or(ApiError::NotFound)?;
        post.is_liked = !post.is_liked;
        if post.is_liked {
            post.likes_count += 1;
        } else {
            post.likes_count = post.likes_count.saturating_sub(1);
        }
        Ok(LikeOutcome {
            liked: Some(post.is_liked),
            likes_count: Some(post.likes_count),
            message: Some(if post.is_liked { "Post liked." } else { "Like removed." }.into()),
        })
    }

    fn delete_post(&self, id: PostId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let before = state.posts.len();
        state.posts.retain(|post| post.id != id);
        if state.posts.len() == before {
            return Err(ApiError::NotFound);
        }
        Ok(())
    }

    fn update_post(&self, id: PostId, content: &str) -> Result<Post, ApiError> {
        if content.trim().is_empty() {
            return Err(ApiError::Validation("content: This field may not be blank.".into()));
        }
        let mut state = self.state.lock();
        let post = state
            .posts
            .iter_mut()
            .find(|post| post.id == id)
            .ok_or(ApiError::NotFound)?;
        post.content = content.to_string();
        post.updated_at = Some(Utc::now());
        Ok(post.clone())
    }
}

pub fn sample_posts() -> Vec<Post> {
    let samples = [
        ("feedroll", "Welcome to feedroll! Type `help` to see what you can do."),
        ("ana", "Just shipped a new release of my side project."),
        ("marco", "Anyone up for a hike this weekend?"),
        ("ana", "Coffee first, code second."),
        ("lena", "Reading about Rust ownership again. It finally clicked."),
        ("marco", "Sunset from the balcony tonight was unreal."),
        ("lena", "Hot take: tabs are fine."),
    ];
    samples
        .iter()
        .enumerate()
        .map(|(index, (author, content))| Post {
            id: PostId((samples.len() - index) as u64),
            owner: Some(index as u64 + 2),
            owner_username: author.to_string(),
            owner_profile_image: None,
            content: content.to_string(),
            is_owner: false,
            is_liked: index % 3 == 1,
            likes_count: (index as u32 * 7) % 5 + u32::from(index % 3 == 1),
            created_at: None,
            updated_at: None,
        })
        .collect()
}
