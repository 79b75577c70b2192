/// Thread assembly: ancestors walked upward, replies gathered breadth-first
use crate::{
    error::AppViewResult,
    store::{models::PostRow, Store},
};
use std::collections::HashMap;

/// An ancestor slot in a thread
#[derive(Debug, Clone)]
pub enum ThreadParent {
    Found(PostRow),
    /// Referenced by a reply but never indexed (or deleted)
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct ThreadNode {
    pub post: PostRow,
    pub replies: Vec<ThreadNode>,
}

#[derive(Debug, Clone)]
pub struct PostThread {
    pub post: PostRow,
    /// Nearest parent first
    pub parents: Vec<ThreadParent>,
    pub replies: Vec<ThreadNode>,
}

impl Store {
    /// Load the thread around `uri`; `None` when the anchor post is unknown
    pub async fn post_thread(
        &self,
        uri: &str,
        depth: u32,
        parent_height: u32,
    ) -> AppViewResult<Option<PostThread>> {
        let Some(post) = self.post(uri).await? else {
            return Ok(None);
        };

        let mut parents = Vec::new();
        let mut next = post.reply_parent.clone();
        while let Some(parent_uri) = next.take() {
            if parents.len() as u32 >= parent_height {
                break;
            }
            match self.post(&parent_uri).await? {
                Some(parent) => {
                    next = parent.reply_parent.clone();
                    parents.push(ThreadParent::Found(parent));
                }
                None => parents.push(ThreadParent::NotFound(parent_uri)),
            }
        }

        // Gather descendants one level at a time
        let mut children: HashMap<String, Vec<PostRow>> = HashMap::new();
        let mut frontier = vec![post.uri.clone()];
        for _ in 0..depth {
            let level = self.replies_to(&frontier).await?;
            if level.is_empty() {
                break;
            }
            frontier = level.iter().map(|p| p.uri.clone()).collect();
            for reply in level {
                if let Some(parent) = reply.reply_parent.clone() {
                    children.entry(parent).or_default().push(reply);
                }
            }
        }

        let replies = assemble(&post.uri, &mut children);
        Ok(Some(PostThread {
            post,
            parents,
            replies,
        }))
    }
}

fn assemble(uri: &str, children: &mut HashMap<String, Vec<PostRow>>) -> Vec<ThreadNode> {
    children
        .remove(uri)
        .unwrap_or_default()
        .into_iter()
        .map(|post| {
            let replies = assemble(&post.uri, children);
            ThreadNode { post, replies }
        })
        .collect()
}
