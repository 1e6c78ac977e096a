use rand::seq::IndexedRandom;

/// Identity used for the short-link host, which blocks browser-like agents
/// coming from servers more eagerly than plain tools.
pub const SHORT_LINK_USER_AGENT: &str = "curl/8.0";

pub const REFERER: &str = "https://www.bilibili.com/";
pub const ORIGIN: &str = "https://www.bilibili.com";

const CHROME_VERSIONS: [&str; 5] = [
    "144.0.0.0",
    "143.0.0.0",
    "142.0.0.0",
    "141.0.0.0",
    "140.0.0.0",
];

const PLATFORMS: [&str; 3] = [
    "Windows NT 10.0; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "X11; Linux x86_64",
];

/// Generate a desktop Chrome user agent.
pub fn browser_user_agent() -> String {
    let mut rng = rand::rng();
    let platform = PLATFORMS.choose(&mut rng).unwrap_or(&PLATFORMS[0]);
    let version = CHROME_VERSIONS
        .choose(&mut rng)
        .unwrap_or(&CHROME_VERSIONS[0]);
    format!(
        "Mozilla/5.0 ({platform}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version} Safari/537.36"
    )
}

pub fn default_headers() -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(user_agent) = browser_user_agent().parse() {
        headers.insert(reqwest::header::USER_AGENT, user_agent);
    }
    headers.insert(
        reqwest::header::REFERER,
        reqwest::header::HeaderValue::from_static(REFERER),
    );
    headers
}
