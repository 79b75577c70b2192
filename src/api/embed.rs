/// Embed hydration: stored record embeds into their `#view` counterparts
///
/// Blob references resolve to the upstream server's getBlob endpoint.
use crate::{context::AppContext, records::BlobRef};
use serde_json::{json, Value};
use std::collections::HashMap;

const IMAGES: &str = "app.bsky.embed.images";
const EXTERNAL: &str = "app.bsky.embed.external";
const VIDEO: &str = "app.bsky.embed.video";
const RECORD: &str = "app.bsky.embed.record";
const RECORD_WITH_MEDIA: &str = "app.bsky.embed.recordWithMedia";

fn embed_type(embed: &Value) -> Option<&str> {
    embed.get("$type").and_then(Value::as_str)
}

/// The post quoted by a record embed, if any
pub fn quoted_uri(embed: &Value) -> Option<&str> {
    match embed_type(embed)? {
        RECORD => embed["record"]["uri"].as_str(),
        RECORD_WITH_MEDIA => embed["record"]["record"]["uri"].as_str(),
        _ => None,
    }
}

/// Hydrate an embed authored by `did`; `quoted` holds `#viewRecord` values keyed by uri
pub fn embed_view(
    ctx: &AppContext,
    did: &str,
    embed: &Value,
    quoted: &HashMap<String, Value>,
) -> Option<Value> {
    match embed_type(embed)? {
        RECORD => Some(record_view(&embed["record"], quoted)),
        RECORD_WITH_MEDIA => {
            let media = media_view(ctx, did, &embed["media"])?;
            Some(json!({
                "$type": format!("{}#view", RECORD_WITH_MEDIA),
                "record": record_view(&embed["record"], quoted),
                "media": media,
            }))
        }
        _ => media_view(ctx, did, embed),
    }
}

fn media_view(ctx: &AppContext, did: &str, embed: &Value) -> Option<Value> {
    match embed_type(embed)? {
        IMAGES => Some(images_view(ctx, did, embed)),
        EXTERNAL => Some(external_view(ctx, did, embed)),
        VIDEO => video_view(ctx, did, embed),
        _ => None,
    }
}

fn blob_cid(blob: &Value) -> Option<String> {
    serde_json::from_value::<BlobRef>(blob.clone()).ok()?.cid()
}

fn images_view(ctx: &AppContext, did: &str, embed: &Value) -> Value {
    let images: Vec<Value> = embed["images"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|image| {
            let url = ctx.blob_url(did, &blob_cid(&image["image"])?);
            let mut view = json!({
                "thumb": url,
                "fullsize": url,
                "alt": image["alt"].as_str().unwrap_or_default(),
            });
            if let Some(ratio) = image.get("aspectRatio") {
                view["aspectRatio"] = ratio.clone();
            }
            Some(view)
        })
        .collect();

    json!({ "$type": format!("{}#view", IMAGES), "images": images })
}

fn external_view(ctx: &AppContext, did: &str, embed: &Value) -> Value {
    let external = &embed["external"];
    let mut view = json!({
        "uri": external["uri"].as_str().unwrap_or_default(),
        "title": external["title"].as_str().unwrap_or_default(),
        "description": external["description"].as_str().unwrap_or_default(),
    });
    if let Some(cid) = blob_cid(&external["thumb"]) {
        view["thumb"] = json!(ctx.blob_url(did, &cid));
    }

    json!({ "$type": format!("{}#view", EXTERNAL), "external": view })
}

fn video_view(ctx: &AppContext, did: &str, embed: &Value) -> Option<Value> {
    let cid = blob_cid(&embed["video"])?;
    let mut view = json!({
        "$type": format!("{}#view", VIDEO),
        "playlist": ctx.blob_url(did, &cid),
        "cid": cid,
    });
    if let Some(alt) = embed.get("alt") {
        view["alt"] = alt.clone();
    }
    if let Some(ratio) = embed.get("aspectRatio") {
        view["aspectRatio"] = ratio.clone();
    }
    Some(view)
}

fn record_view(strong_ref: &Value, quoted: &HashMap<String, Value>) -> Value {
    let uri = strong_ref["uri"].as_str().unwrap_or_default();
    let record = quoted.get(uri).cloned().unwrap_or_else(|| {
        json!({
            "$type": format!("{}#viewNotFound", RECORD),
            "uri": uri,
            "notFound": true,
        })
    });

    json!({ "$type": format!("{}#view", RECORD), "record": record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    const ALICE: &str = "did:plc:alice";

    fn blob(cid: &str) -> Value {
        json!({"$type": "blob", "ref": {"$link": cid}, "mimeType": "image/jpeg", "size": 1024})
    }

    #[tokio::test]
    async fn test_images_embed() {
        let (ctx, _dir) = test_context().await;
        let embed = json!({
            "$type": "app.bsky.embed.images",
            "images": [
                {"image": blob("bafkimg1"), "alt": "a cat", "aspectRatio": {"width": 4, "height": 3}},
                {"image": {"broken": true}, "alt": "skipped"}
            ]
        });

        let view = embed_view(&ctx, ALICE, &embed, &HashMap::new()).unwrap();
        let url = ctx.blob_url(ALICE, "bafkimg1");
        assert_eq!(
            view,
            json!({
                "$type": "app.bsky.embed.images#view",
                "images": [{
                    "thumb": url,
                    "fullsize": url,
                    "alt": "a cat",
                    "aspectRatio": {"width": 4, "height": 3}
                }]
            })
        );
    }

    #[tokio::test]
    async fn test_external_embed() {
        let (ctx, _dir) = test_context().await;
        let embed = json!({
            "$type": "app.bsky.embed.external",
            "external": {
                "uri": "https://example.com",
                "title": "Example",
                "description": "A page",
                "thumb": blob("bafkthumb")
            }
        });

        let view = embed_view(&ctx, ALICE, &embed, &HashMap::new()).unwrap();
        assert_eq!(view["$type"], "app.bsky.embed.external#view");
        assert_eq!(view["external"]["title"], "Example");
        assert_eq!(view["external"]["thumb"], json!(ctx.blob_url(ALICE, "bafkthumb")));
    }

    #[tokio::test]
    async fn test_quote_embeds() {
        let (ctx, _dir) = test_context().await;
        let quoted_uri = "at://did:plc:bob/app.bsky.feed.post/1";
        let embed = json!({
            "$type": "app.bsky.embed.recordWithMedia",
            "record": {"$type": "app.bsky.embed.record", "record": {"uri": quoted_uri, "cid": "bafyq"}},
            "media": {"$type": "app.bsky.embed.images", "images": [{"image": blob("bafkimg"), "alt": ""}]}
        });
        assert_eq!(self::quoted_uri(&embed), Some(quoted_uri));

        let missing = embed_view(&ctx, ALICE, &embed, &HashMap::new()).unwrap();
        assert_eq!(
            missing["record"]["record"]["$type"],
            "app.bsky.embed.record#viewNotFound"
        );
        assert_eq!(missing["media"]["$type"], "app.bsky.embed.images#view");

        let mut quoted = HashMap::new();
        quoted.insert(
            quoted_uri.to_string(),
            json!({"$type": "app.bsky.embed.record#viewRecord", "uri": quoted_uri}),
        );
        let plain = json!({"$type": "app.bsky.embed.record", "record": {"uri": quoted_uri, "cid": "bafyq"}});
        let found = embed_view(&ctx, ALICE, &plain, &quoted).unwrap();
        assert_eq!(found["record"]["$type"], "app.bsky.embed.record#viewRecord");
    }

    #[tokio::test]
    async fn test_unknown_embed_is_dropped() {
        let (ctx, _dir) = test_context().await;
        let embed = json!({"$type": "com.example.widget", "x": 1});
        assert!(embed_view(&ctx, ALICE, &embed, &HashMap::new()).is_none());
        assert!(quoted_uri(&embed).is_none());
    }
}
