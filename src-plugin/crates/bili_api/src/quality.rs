/// Platform quality tier codes (`qn`) and their display names.
///
/// 6 (240P 极速, mp4 only with `platform=html5`), 100 (智能修复) and
/// 129 (HDR Vivid) are never requested and stay out of the table.
pub const QN_INFO: &[(i64, &str)] = &[
    (16, "360P 流畅"),
    (32, "480P 清晰"),
    // web default, falls back to 720P60 when missing
    (64, "720P 高清"),
    (74, "720P60 高帧率"),
    (80, "1080P 高清"),
    (112, "1080P+ 高码率"),
    (116, "1080P60 高帧率"),
    // needs fnval&128 and fourk=1
    (120, "4K 超清"),
    // dash only, fnval&64
    (125, "HDR 真彩色"),
    // dash only, fnval&512
    (126, "杜比视界"),
    // dash only, fnval&1024
    (127, "8K 超高清"),
];

/// Tier used in automatic mode when a session credential is configured.
pub const DEFAULT_QN_LOGGED_IN: i64 = 64;
/// Tier used in automatic mode for guests.
pub const DEFAULT_QN_GUEST: i64 = 32;
/// Tiers at or above this need `fourk=1`.
pub const FOURK_QN: i64 = 120;

pub fn qn_name(qn: i64) -> String {
    QN_INFO
        .iter()
        .find(|(code, _)| *code == qn)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("未知({qn})"))
}

pub fn is_known_qn(qn: i64) -> bool {
    QN_INFO.iter().any(|(code, _)| *code == qn)
}

/// Resolve the tier sent to the platform. `0` means automatic.
pub fn effective_qn(requested: i64, logged_in: bool) -> i64 {
    if requested == 0 {
        if logged_in {
            DEFAULT_QN_LOGGED_IN
        } else {
            DEFAULT_QN_GUEST
        }
    } else {
        requested
    }
}

/// Human readable reasons why `qn` is likely to fail for a guest.
/// Empty when logged in or when the tier is open to everyone.
pub fn privilege_warnings(qn: i64, logged_in: bool) -> Vec<String> {
    if logged_in {
        return Vec::new();
    }
    let name = qn_name(qn);
    let mut warnings = Vec::new();
    if qn >= 64 {
        warnings.push(format!("请求{name}清晰度但未登录，可能失败"));
    }
    if qn >= 80 {
        warnings.push(format!("请求{name}清晰度需要大会员账号"));
    }
    if qn >= 116 {
        warnings.push(format!("请求{name}高帧率需要大会员账号"));
    }
    if qn >= 125 {
        warnings.push(format!("请求{name}需要大会员账号"));
    }
    warnings
}
