use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::errors::BiliApiError;
use crate::http::HttpFetch;
use crate::user_agent;
use serde_json::{Map, Value};
use tokio::time::Instant;

pub const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

/// How long a derived mixin key stays valid.
pub const KEY_TTL: Duration = Duration::from_secs(3600);

// Method from js code
const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

#[derive(Clone, Debug)]
struct CachedKey {
    mixin_key: String,
    fetched_at: Instant,
}

/// Signs query parameters for the `wbi` flavoured endpoints.
///
/// One instance is meant to live for the whole process and be shared by
/// every caller. The derived key is cached for [`KEY_TTL`]; concurrent
/// callers racing on an expired key may each fetch a fresh one, the last
/// write wins and every cached value is a complete derivation.
pub struct WbiSigner {
    http: Arc<dyn HttpFetch>,
    ttl: Duration,
    cache: RwLock<Option<CachedKey>>,
}

impl WbiSigner {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        Self::with_ttl(http, KEY_TTL)
    }

    pub fn with_ttl(http: Arc<dyn HttpFetch>, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Return the cached mixin key, or fetch and derive a new one when the
    /// cache is empty or older than the ttl.
    pub async fn mixin_key(&self) -> Result<String, BiliApiError> {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }

        let (img_key, sub_key) = self.fetch_wbi_keys().await?;
        let mixin_key = derive_mixin_key(&img_key, &sub_key)?;
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(CachedKey {
                mixin_key: mixin_key.clone(),
                fetched_at: Instant::now(),
            });
        }
        log::debug!("WBI mixin key refreshed");
        Ok(mixin_key)
    }

    fn cached(&self) -> Option<String> {
        let cache = self.cache.read().ok()?;
        cache
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.mixin_key.clone())
    }

    async fn fetch_wbi_keys(&self) -> Result<(String, String), BiliApiError> {
        let body = self
            .http
            .get_text(NAV_URL, user_agent::default_headers())
            .await?;
        // nav answers -101 for guests but still carries wbi_img, so code is not checked
        let nav_info: Value = serde_json::from_str(&body)?;
        let wbi_img = &nav_info["data"]["wbi_img"];
        let img_url = wbi_img["img_url"].as_str().unwrap_or("");
        let sub_url = wbi_img["sub_url"].as_str().unwrap_or("");
        Ok((key_from_url(img_url), key_from_url(sub_url)))
    }

    /// Return a copy of `params` with `wts` and `w_rid` added.
    pub async fn sign_params(
        &self,
        params: &Map<String, Value>,
    ) -> Result<Map<String, Value>, BiliApiError> {
        let mixin_key = self.mixin_key().await?;
        let wts = chrono::Utc::now().timestamp();
        Ok(sign_with_key(params, &mixin_key, wts))
    }
}

/// `https://i0.hdslb.com/bfs/wbi/7cd08494.png` -> `7cd08494`
fn key_from_url(url: &str) -> String {
    let filename = url.rsplit('/').next().unwrap_or("");
    filename.split('.').next().unwrap_or("").to_string()
}

pub fn derive_mixin_key(img_key: &str, sub_key: &str) -> Result<String, BiliApiError> {
    let raw = format!("{img_key}{sub_key}");
    let raw = raw.as_bytes();
    if raw.len() < 64 {
        log::warn!("WBI key length insufficient: {}", raw.len());
        return Err(BiliApiError::SigningKey { len: raw.len() });
    }
    let encoded: Vec<u8> = MIXIN_KEY_ENC_TAB
        .iter()
        .take(32)
        .map(|&i| raw[i])
        .collect();
    String::from_utf8(encoded).map_err(|_| BiliApiError::SigningKey { len: raw.len() })
}

fn value_to_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Serialize `params` sorted by key into a query string.
pub fn encode_query(params: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| {
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(&value_to_param(&params[k.as_str()]))
            )
        })
        .collect::<Vec<String>>()
        .join("&")
}

pub(crate) fn sign_with_key(
    params: &Map<String, Value>,
    mixin_key: &str,
    wts: i64,
) -> Map<String, Value> {
    let mut signed: Map<String, Value> = params
        .iter()
        .map(|(k, v)| {
            let v = match v {
                // the platform rejects signatures over !'()*
                Value::String(s) => Value::String(s.replace(['!', '\'', '(', ')', '*'], "")),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect();
    signed.insert("wts".to_owned(), Value::String(wts.to_string()));
    let query = encode_query(&signed);
    let w_rid = md5::compute(query + mixin_key);
    signed.insert("w_rid".to_owned(), Value::String(format!("{w_rid:x}")));
    signed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::MockFetch;
    use serde_json::json;

    const IMG_KEY: &str = "7cd084941338484aae1ad9425b84077c";
    const SUB_KEY: &str = "4932caff0ff746eab6f01bf08b70ac45";
    const MIXIN_KEY: &str = "ea1db124af3c7062474693fa704f4ff8";

    fn nav_body() -> String {
        json!({
            "code": -101,
            "message": "账号未登录",
            "data": {
                "isLogin": false,
                "wbi_img": {
                    "img_url": format!("https://i0.hdslb.com/bfs/wbi/{IMG_KEY}.png"),
                    "sub_url": format!("https://i0.hdslb.com/bfs/wbi/{SUB_KEY}.png"),
                }
            }
        })
        .to_string()
    }

    fn as_map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_derive_mixin_key() {
        assert_eq!(derive_mixin_key(IMG_KEY, SUB_KEY).unwrap(), MIXIN_KEY);
    }

    #[test]
    fn test_derive_mixin_key_too_short() {
        let err = derive_mixin_key("abc", "def").unwrap_err();
        assert!(matches!(err, BiliApiError::SigningKey { len: 6 }));
    }

    #[test]
    fn test_key_from_url() {
        assert_eq!(
            key_from_url("https://i0.hdslb.com/bfs/wbi/7cd08494.png"),
            "7cd08494"
        );
        assert_eq!(key_from_url(""), "");
    }

    #[test]
    fn test_sign_with_key_known_vector() {
        let params = as_map(json!({ "foo": "114", "bar": "514", "zab": 1919810 }));
        let signed = sign_with_key(&params, MIXIN_KEY, 1702204169);
        assert_eq!(signed["wts"], "1702204169");
        assert_eq!(signed["w_rid"], "8f6f2b5b3d485fe1886cec6a0be8c5d4");
        // input untouched
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_sign_with_key_strips_reserved_chars() {
        let dirty = sign_with_key(&as_map(json!({ "x": "a!b'c(d)e*f" })), MIXIN_KEY, 1700000000);
        let clean = sign_with_key(&as_map(json!({ "x": "abcdef" })), MIXIN_KEY, 1700000000);
        assert_eq!(dirty["w_rid"], clean["w_rid"]);
        assert_eq!(dirty["w_rid"], "a3774977c1bf0dddc46ffcf7a8ef2aad");
        assert_eq!(dirty["x"], "abcdef");
    }

    #[test]
    fn test_signature_is_reproducible() {
        let params = as_map(json!({ "avid": "170001", "cid": 279786, "platform": "pc" }));
        let signed = sign_with_key(&params, MIXIN_KEY, 1710000000);
        let mut keys: Vec<&String> = signed.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["avid", "cid", "platform", "w_rid", "wts"]);

        let mut unsigned = signed.clone();
        let w_rid = unsigned.remove("w_rid").unwrap();
        let recomputed = md5::compute(encode_query(&unsigned) + MIXIN_KEY);
        assert_eq!(w_rid, format!("{recomputed:x}"));
    }

    #[test]
    fn test_encode_query_sorted_and_escaped() {
        let params = as_map(json!({ "b": "x y", "a": 1, "c": "中" }));
        assert_eq!(encode_query(&params), "a=1&b=x%20y&c=%E4%B8%AD");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixin_key_cached_within_ttl() {
        let mock = Arc::new(MockFetch::new());
        mock.route(NAV_URL, &nav_body());
        let signer = WbiSigner::new(mock.clone());

        assert_eq!(signer.mixin_key().await.unwrap(), MIXIN_KEY);
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(signer.mixin_key().await.unwrap(), MIXIN_KEY);
        assert_eq!(mock.calls_to(NAV_URL), 1);

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(signer.mixin_key().await.unwrap(), MIXIN_KEY);
        assert_eq!(mock.calls_to(NAV_URL), 2);

        signer.mixin_key().await.unwrap();
        assert_eq!(mock.calls_to(NAV_URL), 2);
    }

    #[tokio::test]
    async fn test_sign_params_adds_only_wts_and_w_rid() {
        let mock = Arc::new(MockFetch::new());
        mock.route(NAV_URL, &nav_body());
        let signer = WbiSigner::new(mock.clone());

        let params = as_map(json!({ "mid": "2", "platform": "web" }));
        let signed = signer.sign_params(&params).await.unwrap();
        assert_eq!(signed.len(), 4);
        assert!(signed.contains_key("wts"));
        assert!(signed.contains_key("w_rid"));
        assert_eq!(signed["mid"], "2");
    }

    #[tokio::test]
    async fn test_sign_params_short_keys() {
        let mock = Arc::new(MockFetch::new());
        mock.route(
            NAV_URL,
            r#"{"code":0,"data":{"wbi_img":{"img_url":"https://i0.hdslb.com/bfs/wbi/abc.png","sub_url":""}}}"#,
        );
        let signer = WbiSigner::new(mock.clone());
        let err = signer.sign_params(&Map::new()).await.unwrap_err();
        assert!(matches!(err, BiliApiError::SigningKey { len: 3 }));
    }

    #[tokio::test]
    async fn test_sign_params_network_failure() {
        let mock = Arc::new(MockFetch::new());
        mock.route_err(NAV_URL, "connection reset");
        let signer = WbiSigner::new(mock.clone());
        let err = signer.sign_params(&Map::new()).await.unwrap_err();
        assert!(matches!(err, BiliApiError::Network { .. }));
    }
}
