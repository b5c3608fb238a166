//! 候选套餐优先级
//!
//! 无限次 > 赠送 > 折扣 > 储值。同类型按到期时间先后，再按 id 升序，保证结果稳定。

use crate::models::PackageGrant;

/// 按优先级排序候选套餐
pub fn rank<'a>(mut candidates: Vec<&'a PackageGrant>) -> Vec<&'a PackageGrant> {
    candidates.sort_by(|a, b| {
        a.kind()
            .priority()
            .cmp(&b.kind().priority())
            .then(a.valid_to.cmp(&b.valid_to))
            .then(a.id.cmp(&b.id))
    });
    candidates
}

/// 选出优先级最高的套餐
pub fn select<'a>(candidates: Vec<&'a PackageGrant>) -> Option<&'a PackageGrant> {
    rank(candidates).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BenefitKind, GrantBenefit};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn grant(id: i64, benefit: GrantBenefit, days_left: i64) -> PackageGrant {
        let now = Utc::now();
        PackageGrant {
            id,
            customer_id: 1,
            template_id: 1,
            package_name: String::new(),
            service_id: Some(1),
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(days_left),
            is_active: true,
            benefit,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_kind_priority() {
        let prepaid = grant(1, GrantBenefit::prepaid(dec!(100)), 10);
        let discount = grant(2, GrantBenefit::discount(3, dec!(10)), 10);
        let free = grant(3, GrantBenefit::free(3), 10);
        let unlimited = grant(4, GrantBenefit::Unlimited, 10);

        let all = vec![&prepaid, &discount, &free, &unlimited];
        assert_eq!(select(all).map(|g| g.kind()), Some(BenefitKind::Unlimited));

        let no_unlimited = vec![&prepaid, &discount, &free];
        assert_eq!(select(no_unlimited).map(|g| g.kind()), Some(BenefitKind::Free));

        let tail = vec![&prepaid, &discount];
        assert_eq!(select(tail).map(|g| g.kind()), Some(BenefitKind::Discount));
    }

    #[test]
    fn test_same_kind_prefers_earliest_expiry() {
        let later = grant(1, GrantBenefit::free(3), 30);
        let sooner = grant(2, GrantBenefit::free(3), 5);
        assert_eq!(select(vec![&later, &sooner]).map(|g| g.id), Some(2));
    }

    #[test]
    fn test_empty_candidates() {
        assert!(select(Vec::new()).is_none());
    }
}
